use crate::config::normalize_extension;
use crate::types::Operation;
use std::path::PathBuf;
use thiserror::Error;

const HELP_TOKENS: [&str; 5] = ["-help", "--help", "-h", "/?", "help"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArgsError {
    #[error("{0} expects a value")]
    MissingValue(String),

    #[error("{flag} flag requires a file ending with {ext}")]
    ExtensionMismatch { flag: String, ext: String },

    #[error("unexpected argument '{0}'")]
    Unexpected(String),

    #[error("no file or directory given")]
    NoTarget,
}

/// Target as written on the command line; smart search is resolved later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTarget {
    File(PathBuf),
    Directory { root: PathBuf, recursive: bool },
    Search { root: PathBuf, term: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArgs {
    pub target: RawTarget,
    pub operation: Operation,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Run(ParsedArgs),
}

fn take_value<'a>(flag: &str, it: &mut impl Iterator<Item = &'a String>) -> Result<&'a String, ArgsError> {
    it.next().ok_or_else(|| ArgsError::MissingValue(flag.to_string()))
}

fn require_extension(flag: &str, value: &str, ext: &str) -> Result<(), ArgsError> {
    if value.to_lowercase().ends_with(ext) {
        Ok(())
    } else {
        Err(ArgsError::ExtensionMismatch {
            flag: flag.to_string(),
            ext: ext.to_string(),
        })
    }
}

/// Flags are case-insensitive; values keep their case.
/// `default_extensions` apply to directory scans with no `-types`.
pub fn parse_args(args: &[String], default_extensions: &[String]) -> Result<Invocation, ArgsError> {
    let Some(first) = args.first() else {
        return Ok(Invocation::Help);
    };
    if HELP_TOKENS.contains(&first.to_lowercase().as_str()) {
        return Ok(Invocation::Help);
    }

    let mut target: Option<RawTarget> = None;
    let mut remove = false;
    let mut extensions: Vec<String> = Vec::new();

    let mut it = args.iter().peekable();
    while let Some(raw) = it.next() {
        let flag = raw.to_lowercase();
        match flag.as_str() {
            "-dr" | "-d" | "-remove-dr" | "-remove-d" => {
                let v = take_value(&flag, &mut it)?;
                target = Some(RawTarget::Directory {
                    root: PathBuf::from(v),
                    recursive: flag.ends_with("dr"),
                });
                remove |= flag.starts_with("-remove");
            }
            "-exe" | "-dll" => {
                let v = take_value(&flag, &mut it)?;
                let ext = format!(".{}", &flag[1..]);
                require_extension(&flag, v, &ext)?;
                target = Some(RawTarget::File(PathBuf::from(v)));
            }
            "-file" | "-remove" => {
                let v = take_value(&flag, &mut it)?;
                target = Some(RawTarget::File(PathBuf::from(v)));
                remove |= flag == "-remove";
            }
            "-types" => {
                let v = take_value(&flag, &mut it)?;
                for t in v.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    let ext = normalize_extension(t);
                    if !extensions.contains(&ext) {
                        extensions.push(ext);
                    }
                }
            }
            _ => {
                let is_last = it.peek().is_none();
                target = Some(match target.take() {
                    None => RawTarget::Directory {
                        root: PathBuf::from(raw),
                        recursive: true,
                    },
                    // second positional, last token => smart search
                    Some(RawTarget::Directory { root, .. }) if is_last => RawTarget::Search {
                        root,
                        term: raw.clone(),
                    },
                    Some(_) => return Err(ArgsError::Unexpected(raw.clone())),
                });
            }
        }
    }

    let target = target.ok_or(ArgsError::NoTarget)?;
    if extensions.is_empty() && matches!(target, RawTarget::Directory { .. }) {
        extensions = default_extensions.to_vec();
    }

    Ok(Invocation::Run(ParsedArgs {
        target,
        operation: if remove {
            Operation::RemoveSignature
        } else {
            Operation::Sign
        },
        extensions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn defaults() -> Vec<String> {
        argv(&[".exe", ".dll"])
    }

    fn run(list: &[&str]) -> ParsedArgs {
        match parse_args(&argv(list), &defaults()).unwrap() {
            Invocation::Run(p) => p,
            Invocation::Help => panic!("unexpected help"),
        }
    }

    #[test]
    fn help_and_empty() {
        assert_eq!(parse_args(&[], &defaults()), Ok(Invocation::Help));
        for t in ["-h", "--HELP", "/?", "help", "-Help"] {
            assert_eq!(parse_args(&argv(&[t]), &defaults()), Ok(Invocation::Help));
        }
    }

    #[test]
    fn directory_modes() {
        let p = run(&["-DR", "C:/Build"]);
        assert_eq!(
            p.target,
            RawTarget::Directory {
                root: PathBuf::from("C:/Build"),
                recursive: true
            }
        );
        assert_eq!(p.operation, Operation::Sign);
        assert_eq!(p.extensions, defaults());

        let p = run(&["-d", "bin", "-types", "EXE, msi,,.Sys"]);
        assert_eq!(
            p.target,
            RawTarget::Directory {
                root: PathBuf::from("bin"),
                recursive: false
            }
        );
        assert_eq!(p.extensions, argv(&[".exe", ".msi", ".sys"]));
    }

    #[test]
    fn types_accumulate() {
        let p = run(&["-types", "exe", "-d", "bin", "-types", "dll,exe"]);
        assert_eq!(p.extensions, argv(&[".exe", ".dll"]));
    }

    #[test]
    fn single_file_flags() {
        let p = run(&["-exe", "App.EXE"]);
        assert_eq!(p.target, RawTarget::File(PathBuf::from("App.EXE")));
        assert!(p.extensions.is_empty());

        assert_eq!(
            parse_args(&argv(&["-dll", "app.exe"]), &defaults()),
            Err(ArgsError::ExtensionMismatch {
                flag: "-dll".to_string(),
                ext: ".dll".to_string()
            })
        );

        let p = run(&["-file", "setup.msi"]);
        assert_eq!(p.target, RawTarget::File(PathBuf::from("setup.msi")));
    }

    #[test]
    fn remove_modes() {
        let p = run(&["-remove", "a.exe"]);
        assert_eq!(p.operation, Operation::RemoveSignature);
        assert_eq!(p.target, RawTarget::File(PathBuf::from("a.exe")));

        let p = run(&["-Remove-D", "out"]);
        assert_eq!(p.operation, Operation::RemoveSignature);
        assert_eq!(
            p.target,
            RawTarget::Directory {
                root: PathBuf::from("out"),
                recursive: false
            }
        );

        let p = run(&["-remove-dr", "out"]);
        assert!(matches!(p.target, RawTarget::Directory { recursive: true, .. }));
    }

    #[test]
    fn smart_search_positionals() {
        let p = run(&["C:/Build", "MPTSCore"]);
        assert_eq!(
            p.target,
            RawTarget::Search {
                root: PathBuf::from("C:/Build"),
                term: "MPTSCore".to_string()
            }
        );

        let p = run(&["C:/Build"]);
        assert!(matches!(p.target, RawTarget::Directory { recursive: true, .. }));
    }

    #[test]
    fn malformed() {
        assert_eq!(
            parse_args(&argv(&["-dr"]), &defaults()),
            Err(ArgsError::MissingValue("-dr".to_string()))
        );
        assert_eq!(
            parse_args(&argv(&["-types", "exe"]), &defaults()),
            Err(ArgsError::NoTarget)
        );
        assert_eq!(
            parse_args(&argv(&["-exe", "a.exe", "stray"]), &defaults()),
            Err(ArgsError::Unexpected("stray".to_string()))
        );
    }
}
