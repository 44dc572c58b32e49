//! ---
//! mh_section: "03-remote-session"
//! mh_subsection: "module"
//! mh_type: "source"
//! mh_scope: "code"
//! mh_description: "Typed remote command composition with shell quoting."
//! mh_version: "v0.1.0"
//! mh_owner: "tbd"
//! ---
use std::fmt;

/// Quote `value` for safe interpolation into a POSIX shell command line.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shell flavour a command line is composed for.
///
/// Hosts with the PowerShell capability (AD domain controllers) take
/// single-dash options and explicit `:$True`/`:$False` switches; everything
/// else is POSIX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellFlavor {
    /// POSIX shells, `--option value` style.
    #[default]
    Posix,
    /// PowerShell, `-Option value` style with boolean switches.
    PowerShell,
}

/// One typed command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    /// Named option whose value is passed through unmodified.
    Plain {
        /// Option name without prefix.
        name: String,
        /// Raw value.
        value: String,
    },
    /// Named option whose value is quoted in script mode.
    Value {
        /// Option name without prefix.
        name: String,
        /// Value to quote.
        value: String,
    },
    /// Boolean switch.
    Switch {
        /// Option name without prefix.
        name: String,
        /// Whether the switch is set.
        enabled: bool,
    },
    /// Positional argument, quoted in script mode.
    Positional(String),
}

impl CommandArg {
    /// Named option with a quoted value.
    pub fn value(name: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::Value {
            name: name.into(),
            value: value.to_string(),
        }
    }

    /// Named option with an unquoted value.
    pub fn plain(name: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::Plain {
            name: name.into(),
            value: value.to_string(),
        }
    }

    /// Boolean switch.
    pub fn switch(name: impl Into<String>, enabled: bool) -> Self {
        Self::Switch {
            name: name.into(),
            enabled,
        }
    }

    /// Positional argument.
    pub fn positional(value: impl fmt::Display) -> Self {
        Self::Positional(value.to_string())
    }
}

/// Composes remote command lines and argv vectors from typed arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandBuilder {
    flavor: ShellFlavor,
}

impl CommandBuilder {
    /// Builder for the given shell flavour.
    pub fn new(flavor: ShellFlavor) -> Self {
        Self { flavor }
    }

    fn prefix(&self) -> &'static str {
        match self.flavor {
            ShellFlavor::Posix => "--",
            ShellFlavor::PowerShell => "-",
        }
    }

    /// Render a single command line with values quoted for the shell.
    pub fn command(&self, program: &str, args: &[CommandArg]) -> String {
        self.build(program, args, true).join(" ")
    }

    /// Render an argv vector with values passed verbatim.
    pub fn argv(&self, program: &str, args: &[CommandArg]) -> Vec<String> {
        self.build(program, args, false)
    }

    fn build(&self, program: &str, args: &[CommandArg], quote: bool) -> Vec<String> {
        let render = |value: &str| {
            if quote {
                shell_quote(value)
            } else {
                value.to_owned()
            }
        };

        let mut argv = vec![program.to_owned()];
        for arg in args {
            match arg {
                CommandArg::Positional(value) => argv.push(render(value)),
                CommandArg::Switch { name, enabled } => match self.flavor {
                    ShellFlavor::PowerShell => argv.push(format!(
                        "{}{}:{}",
                        self.prefix(),
                        name,
                        if *enabled { "$True" } else { "$False" }
                    )),
                    ShellFlavor::Posix => {
                        if *enabled {
                            argv.push(format!("{}{}", self.prefix(), name));
                        }
                    }
                },
                CommandArg::Value { name, value } => {
                    argv.push(format!("{}{}", self.prefix(), name));
                    argv.push(render(value));
                }
                CommandArg::Plain { name, value } => {
                    argv.push(format!("{}{}", self.prefix(), name));
                    argv.push(value.clone());
                }
            }
        }
        argv
    }
}
