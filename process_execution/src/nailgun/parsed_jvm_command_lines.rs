// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

///
/// Represents the result of parsing the args of a nailgunnable Process: a JVM command line
/// split into the server portion (the JVM and its options) and the client portion (the main
/// class and its arguments).
///
#[derive(PartialEq, Eq, Debug)]
pub struct ParsedJVMCommandLines {
    pub nailgun_args: Vec<String>,
    pub client_args: Vec<String>,
    pub client_main_class: String,
}

impl ParsedJVMCommandLines {
    ///
    /// Given a command line, clasifies arguments between the arguments used to start the JVM
    /// (the java binary, JVM options, and the classpath) and the arguments belonging to the
    /// client (the main class and everything after it).
    ///
    pub fn parse_command_lines(args: &[String]) -> Result<ParsedJVMCommandLines, String> {
        let mut args_to_consume = args.iter();

        let jdk = Self::parse_jdk(&mut args_to_consume)?;
        let jvm_args = Self::parse_jvm_args(&mut args_to_consume)?;
        let main_class = Self::parse_main_class(&mut args_to_consume)?;
        let client_args = Self::parse_to_end(&mut args_to_consume)?;

        let mut nailgun_args = vec![jdk];
        nailgun_args.extend(jvm_args);

        Ok(ParsedJVMCommandLines {
            nailgun_args,
            client_args,
            client_main_class: main_class,
        })
    }

    fn parse_jdk<'a>(args: &mut impl Iterator<Item = &'a String>) -> Result<String, String> {
        args.next()
            .cloned()
            .ok_or_else(|| "No JDK path in command line.".to_string())
    }

    fn parse_jvm_args<'a>(
        args: &mut (impl Iterator<Item = &'a String> + Clone),
    ) -> Result<Vec<String>, String> {
        let mut jvm_args = Vec::new();
        loop {
            let mut lookahead = args.clone();
            match lookahead.next() {
                Some(arg) if Self::is_flag(arg) => {
                    jvm_args.push(arg.clone());
                    *args = lookahead;
                    // The classpath flag consumes a value as well.
                    if arg == "-cp" || arg == "-classpath" {
                        let classpath = args.next().ok_or_else(|| {
                            format!("Classpath flag {arg} must be followed by a classpath.")
                        })?;
                        jvm_args.push(classpath.clone());
                    }
                }
                _ => break,
            }
        }
        Ok(jvm_args)
    }

    fn parse_main_class<'a>(args: &mut impl Iterator<Item = &'a String>) -> Result<String, String> {
        args.next()
            .cloned()
            .ok_or_else(|| "No main class provided.".to_string())
    }

    fn parse_to_end<'a>(args: &mut impl Iterator<Item = &'a String>) -> Result<Vec<String>, String> {
        Ok(args.cloned().collect())
    }

    fn is_flag(arg: &str) -> bool {
        arg.starts_with('-') || arg.starts_with('@')
    }
}
