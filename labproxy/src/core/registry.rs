//! The static table of proxied commands.
//!
//! Each [`CommandSpec`] names a device tool and the grammar that decides which
//! of its arguments are local files. The table is the proxy's policy surface:
//! it is a `static` slice, built at compile time and never mutated.

use crate::core::grammar::{Grammar, GrammarError, OptionRule, Positional, Subcommand, Value};
use crate::core::types::ArgKind;

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub grammar: Grammar,
}

impl CommandSpec {
    /// Classify the tokens that follow the command name.
    pub fn classify<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<ArgKind>, GrammarError> {
        self.grammar.classify(args)
    }
}

/// Find the spec for `name`, if the command is proxied at all.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

/// Every proxied command, in table order.
pub fn commands() -> &'static [CommandSpec] {
    COMMANDS
}

const HELP: OptionRule = OptionRule::flag(&["-h", "--help"]);
const DEBUG: OptionRule = OptionRule::flag(&["-d", "--debug"]);
const UDID: OptionRule = OptionRule::with_value(&["-u", "--uuid"], Value::IosUdid);

const fn leaf(options: &'static [OptionRule], positionals: &'static [Positional]) -> Grammar {
    Grammar {
        options,
        prefixes: &[],
        positionals,
        subcommands: &[],
    }
}

const fn sub(name: &'static str, grammar: Grammar) -> Subcommand {
    Subcommand { name, grammar }
}

const ADB: Grammar = Grammar {
    options: &[OptionRule::with_value(&["-s"], Value::AndroidSerial)],
    prefixes: &[],
    positionals: &[],
    subcommands: &[
        sub("help", Grammar::EMPTY),
        sub(
            "connect",
            leaf(&[], &[Positional::required("host", Value::Text)]),
        ),
        sub("devices", leaf(&[OptionRule::flag(&["-l"])], &[])),
        sub(
            "install",
            leaf(
                &[OptionRule::flag(&["-r"]), OptionRule::flag(&["-s"])],
                &[Positional::required("file", Value::InputFile)],
            ),
        ),
        sub(
            "logcat",
            leaf(
                &[
                    OptionRule::flag(&["-B"]),
                    OptionRule::with_value(&["-b"], Value::Text),
                    OptionRule::flag(&["-c"]),
                    OptionRule::flag(&["-d"]),
                    OptionRule::with_value(&["-f"], Value::Text),
                    OptionRule::flag(&["-g"]),
                    HELP,
                    OptionRule::with_value(&["-n"], Value::Int),
                    OptionRule::with_value(&["-r"], Value::Int),
                    OptionRule::flag(&["-s"]),
                    OptionRule::with_value(&["-t"], Value::Int),
                    OptionRule::with_value(&["-v"], Value::Text),
                ],
                &[Positional::remainder("filterspecs")],
            ),
        ),
        sub(
            "pull",
            leaf(
                &[],
                &[
                    Positional::required("remote", Value::Text),
                    Positional::required("local", Value::OutputFile),
                ],
            ),
        ),
        sub(
            "push",
            leaf(
                &[],
                &[
                    Positional::required("local", Value::InputFile),
                    Positional::required("remote", Value::Text),
                ],
            ),
        ),
        sub("root", Grammar::EMPTY),
        sub(
            "shell",
            leaf(
                &[],
                &[
                    Positional::required("arg0", Value::Text),
                    Positional::remainder("args"),
                ],
            ),
        ),
        sub(
            "uninstall",
            leaf(
                &[OptionRule::flag(&["-k"])],
                &[Positional::required("package", Value::Text)],
            ),
        ),
        sub("wait-for-device", Grammar::EMPTY),
    ],
};

const IDEVICE_APP_RUNNER: Grammar = Grammar {
    options: &[
        HELP,
        UDID,
        OptionRule::with_value(&["-D"], Value::Text),
        OptionRule::with_value(&["-s", "--start"], Value::Text),
        OptionRule::with_value(&["--args"], Value::Rest),
    ],
    prefixes: &["-D"],
    positionals: &[],
    subcommands: &[],
};

const IDEVICEFS: Grammar = Grammar {
    options: &[DEBUG, HELP, UDID],
    prefixes: &[],
    positionals: &[],
    subcommands: &[
        sub("help", Grammar::EMPTY),
        sub(
            "ls",
            leaf(
                &[
                    OptionRule::flag(&["-F"]),
                    OptionRule::flag(&["-R"]),
                    OptionRule::flag(&["-l"]),
                ],
                &[Positional::optional("remote", Value::Text)],
            ),
        ),
        sub(
            "pull",
            leaf(
                &[],
                &[
                    Positional::required("remote", Value::Text),
                    Positional::required("local", Value::OutputFile),
                ],
            ),
        ),
        sub(
            "push",
            leaf(
                &[],
                &[
                    Positional::required("local", Value::InputFile),
                    Positional::optional("remote", Value::Text),
                ],
            ),
        ),
        sub(
            "rm",
            leaf(
                &[
                    OptionRule::flag(&["-d"]),
                    OptionRule::flag(&["-f"]),
                    OptionRule::flag(&["-R"]),
                ],
                &[Positional::required("remote", Value::Text)],
            ),
        ),
    ],
};

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "adb",
        grammar: ADB,
    },
    CommandSpec {
        name: "idevice-app-runner",
        grammar: IDEVICE_APP_RUNNER,
    },
    CommandSpec {
        name: "idevice_id",
        grammar: leaf(&[DEBUG, HELP, OptionRule::flag(&["-l", "--list"])], &[]),
    },
    CommandSpec {
        name: "idevicedate",
        grammar: leaf(&[DEBUG, HELP, UDID], &[]),
    },
    CommandSpec {
        name: "idevicediagnostics",
        grammar: leaf(
            &[HELP, UDID],
            &[
                Positional::required("command", Value::Choice(&["diagnostics"])),
                Positional::required("option", Value::Choice(&["All", "WiFi"])),
            ],
        ),
    },
    CommandSpec {
        name: "idevicefs",
        grammar: IDEVICEFS,
    },
    CommandSpec {
        name: "ideviceimagemounter",
        grammar: leaf(
            &[DEBUG, HELP, OptionRule::flag(&["-l", "--list"]), UDID],
            &[
                Positional::required("image", Value::InputFile),
                Positional::required("signature", Value::InputFile),
            ],
        ),
    },
    CommandSpec {
        name: "ideviceinfo",
        grammar: leaf(
            &[
                DEBUG,
                HELP,
                OptionRule::with_value(&["-k", "--key"], Value::Text),
                UDID,
                OptionRule::with_value(&["-q", "--domain"], Value::Text),
                OptionRule::flag(&["-s", "--simple"]),
                OptionRule::flag(&["-x", "--xml"]),
            ],
            &[],
        ),
    },
    CommandSpec {
        name: "ideviceinstaller",
        grammar: leaf(
            &[
                UDID,
                DEBUG,
                HELP,
                OptionRule::with_value(&["-i", "--install"], Value::InputFile),
                OptionRule::flag(&["-l", "--list", "--list-apps"]),
                OptionRule::with_value(&["-o", "--options"], Value::Text),
                OptionRule::with_value(&["-U", "--uninstall"], Value::Text),
            ],
            &[],
        ),
    },
    CommandSpec {
        name: "idevicescreenshot",
        grammar: leaf(
            &[DEBUG, HELP, UDID],
            &[Positional::required("local", Value::OutputFile)],
        ),
    },
    CommandSpec {
        name: "idevicesyslog",
        grammar: leaf(&[DEBUG, HELP, UDID], &[]),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use ArgKind::{InputFile, OutputFile, Plain};

    const UDID_40: &str = "0123456789abcdef0123456789abcdef01234567";

    fn classify(command: &str, args: &[&str]) -> Result<Vec<ArgKind>, GrammarError> {
        lookup(command).expect("registered").classify(args)
    }

    #[test]
    fn lookup_unknown_command_is_none() {
        assert!(lookup("rm").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn command_names_are_unique() {
        let mut names: Vec<&str> = commands().iter().map(|spec| spec.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), commands().len());
    }

    #[test]
    fn adb_install_marks_package_as_input() {
        let kinds = classify("adb", &["-s", "X", "install", "/local/Test.apk"]).expect("classify");
        assert_eq!(kinds, vec![Plain, Plain, Plain, InputFile]);
    }

    #[test]
    fn adb_install_accepts_flags_before_file() {
        let kinds = classify("adb", &["install", "-r", "app.apk"]).expect("classify");
        assert_eq!(kinds, vec![Plain, Plain, InputFile]);
    }

    #[test]
    fn adb_push_and_pull_mark_local_side() {
        assert_eq!(
            classify("adb", &["push", "a.txt", "/sdcard/a.txt"]).expect("push"),
            vec![Plain, InputFile, Plain]
        );
        assert_eq!(
            classify("adb", &["pull", "/sdcard/a.txt", "a.txt"]).expect("pull"),
            vec![Plain, Plain, OutputFile]
        );
    }

    #[test]
    fn adb_shell_forwards_everything() {
        let kinds = classify("adb", &["shell", "pm", "list", "packages", "-f"]).expect("shell");
        assert_eq!(kinds, vec![Plain; 5]);
    }

    #[test]
    fn adb_logcat_options_then_filters() {
        let kinds = classify("adb", &["logcat", "-v", "time", "-d", "ActivityManager:I", "*:S"])
            .expect("logcat");
        assert_eq!(kinds, vec![Plain; 6]);
        assert!(classify("adb", &["logcat", "-t", "soon"]).is_err());
    }

    #[test]
    fn adb_requires_subcommand() {
        assert!(matches!(
            classify("adb", &[]),
            Err(GrammarError::MissingSubcommand(_))
        ));
    }

    #[test]
    fn screenshot_marks_output() {
        let kinds = classify("idevicescreenshot", &["-u", UDID_40, "shot.png"]).expect("classify");
        assert_eq!(kinds, vec![Plain, Plain, OutputFile]);
    }

    #[test]
    fn screenshot_rejects_bad_udid() {
        assert!(matches!(
            classify("idevicescreenshot", &["-u", "abc", "shot.png"]),
            Err(GrammarError::InvalidValue { .. })
        ));
    }

    #[test]
    fn image_mounter_takes_two_inputs() {
        let kinds = classify("ideviceimagemounter", &["DeveloperDiskImage.dmg", "image.signature"])
            .expect("classify");
        assert_eq!(kinds, vec![InputFile, InputFile]);
    }

    #[test]
    fn installer_install_option_is_input() {
        let kinds = classify("ideviceinstaller", &["-u", UDID_40, "-i", "App.ipa"]).expect("classify");
        assert_eq!(kinds, vec![Plain, Plain, Plain, InputFile]);
    }

    #[test]
    fn idevicefs_subcommands() {
        assert_eq!(
            classify("idevicefs", &["push", "local.txt"]).expect("push"),
            vec![Plain, InputFile]
        );
        assert_eq!(
            classify("idevicefs", &["-u", UDID_40, "pull", "/Documents/x", "x"]).expect("pull"),
            vec![Plain, Plain, Plain, Plain, OutputFile]
        );
        assert_eq!(
            classify("idevicefs", &["ls", "-l"]).expect("ls"),
            vec![Plain, Plain]
        );
    }

    #[test]
    fn diagnostics_restricts_choices() {
        assert!(classify("idevicediagnostics", &["diagnostics", "WiFi"]).is_ok());
        assert!(classify("idevicediagnostics", &["restart", "All"]).is_err());
    }

    #[test]
    fn app_runner_accepts_defines() {
        let kinds = classify(
            "idevice-app-runner",
            &["-DFOO=1", "-D", "BAR=2", "--start", "com.example.app"],
        )
        .expect("classify");
        assert_eq!(kinds, vec![Plain; 5]);
    }

    #[test]
    fn app_runner_args_forwards_the_rest() {
        let kinds = classify(
            "idevice-app-runner",
            &["-s", "com.example.app", "--args", "-v", "extra"],
        )
        .expect("classify");
        assert_eq!(kinds, vec![Plain; 5]);
    }
}
