// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::nailgun::parsed_jvm_command_lines::ParsedJVMCommandLines;

fn strs(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[test]
fn parses_a_simple_command_line() {
    let args = strs(&[
        ".jdk/bin/java",
        "-Xmx1g",
        "-cp",
        "scala-compiler.jar:scala-library.jar",
        "scala.tools.nsc.Main",
        "-S",
        "Source.scala",
    ]);
    let parsed = ParsedJVMCommandLines::parse_command_lines(&args).unwrap();
    assert_eq!(
        parsed,
        ParsedJVMCommandLines {
            nailgun_args: strs(&[
                ".jdk/bin/java",
                "-Xmx1g",
                "-cp",
                "scala-compiler.jar:scala-library.jar",
            ]),
            client_args: strs(&["-S", "Source.scala"]),
            client_main_class: "scala.tools.nsc.Main".to_string(),
        }
    );
}

#[test]
fn parses_without_jvm_args() {
    let args = strs(&[".jdk/bin/java", "org.pantsbuild.Main"]);
    let parsed = ParsedJVMCommandLines::parse_command_lines(&args).unwrap();
    assert_eq!(parsed.nailgun_args, strs(&[".jdk/bin/java"]));
    assert_eq!(parsed.client_main_class, "org.pantsbuild.Main");
    assert!(parsed.client_args.is_empty());
}

#[test]
fn argfiles_belong_to_the_jvm() {
    let args = strs(&[".jdk/bin/java", "@argfile", "com.example.Main"]);
    let parsed = ParsedJVMCommandLines::parse_command_lines(&args).unwrap();
    assert_eq!(parsed.nailgun_args, strs(&[".jdk/bin/java", "@argfile"]));
    assert_eq!(parsed.client_main_class, "com.example.Main");
}

#[test]
fn missing_main_class_is_an_error() {
    let args = strs(&[".jdk/bin/java", "-Xmx1g"]);
    ParsedJVMCommandLines::parse_command_lines(&args).expect_err("want err");
}

#[test]
fn dangling_classpath_flag_is_an_error() {
    let args = strs(&[".jdk/bin/java", "-cp"]);
    ParsedJVMCommandLines::parse_command_lines(&args).expect_err("want err");
}
