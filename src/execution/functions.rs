//! Built-in Functions
//!
//! The closed set of operations a `function` step (or a condition) may
//! call. There is no way to register new functions at runtime.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};

/// Every callable built-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    CreateFolder,
    ReadFile,
    FileExists,
    FileLength,
    Length,
    Trim,
    AppendFile,
    RemoveFile,
    LogInfo,
}

impl Builtin {
    pub const ALL: [Builtin; 9] = [
        Builtin::CreateFolder,
        Builtin::ReadFile,
        Builtin::FileExists,
        Builtin::FileLength,
        Builtin::Length,
        Builtin::Trim,
        Builtin::AppendFile,
        Builtin::RemoveFile,
        Builtin::LogInfo,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateFolder => "create_folder",
            Self::ReadFile => "read_file",
            Self::FileExists => "file_exists",
            Self::FileLength => "file_length",
            Self::Length => "length",
            Self::Trim => "trim",
            Self::AppendFile => "append_file",
            Self::RemoveFile => "remove_file",
            Self::LogInfo => "log_info",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Self::AppendFile => 2,
            _ => 1,
        }
    }
}

/// Calls a built-in by name.
///
/// Relative paths are resolved against `working_dir` when one is set.
/// Errors are plain messages; callers attach the node name.
pub fn call(name: &str, args: &[String], working_dir: Option<&Path>) -> Result<String, String> {
    let builtin = Builtin::from_name(name).ok_or_else(|| format!("unknown function '{}'", name))?;

    if args.len() != builtin.arity() {
        return Err(format!(
            "function '{}' expects {} argument(s), got {}",
            name,
            builtin.arity(),
            args.len()
        ));
    }

    debug!("Calling {}({:?})", name, args);
    let path = |arg: &str| resolve_path(arg, working_dir);

    match builtin {
        Builtin::CreateFolder => {
            let dir = path(&args[0]);
            fs::create_dir_all(&dir)
                .map_err(|e| format!("cannot create '{}': {}", dir.display(), e))?;
            Ok(args[0].clone())
        }
        Builtin::ReadFile => {
            let file = path(&args[0]);
            fs::read_to_string(&file).map_err(|e| format!("cannot read '{}': {}", file.display(), e))
        }
        Builtin::FileExists => Ok(path(&args[0]).exists().to_string()),
        Builtin::FileLength => {
            let file = path(&args[0]);
            let count = match fs::read_to_string(&file) {
                Ok(content) => content.lines().filter(|l| !l.trim().is_empty()).count(),
                Err(_) => 0,
            };
            Ok(count.to_string())
        }
        Builtin::Length => Ok(args[0].chars().count().to_string()),
        Builtin::Trim => Ok(args[0].trim().to_string()),
        Builtin::AppendFile => {
            let file = path(&args[0]);
            let mut handle = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file)
                .map_err(|e| format!("cannot open '{}': {}", file.display(), e))?;
            writeln!(handle, "{}", args[1])
                .map_err(|e| format!("cannot write '{}': {}", file.display(), e))?;
            Ok(args[0].clone())
        }
        Builtin::RemoveFile => {
            let file = path(&args[0]);
            if !file.exists() {
                return Ok("false".to_string());
            }
            fs::remove_file(&file).map_err(|e| format!("cannot remove '{}': {}", file.display(), e))?;
            Ok("true".to_string())
        }
        Builtin::LogInfo => {
            info!("{}", args[0]);
            Ok(args[0].clone())
        }
    }
}

fn resolve_path(arg: &str, working_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(arg);
    match working_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_builtin_names_round_trip() {
        for builtin in Builtin::ALL {
            assert_eq!(Builtin::from_name(builtin.name()), Some(builtin));
        }
        assert_eq!(Builtin::from_name("exec"), None);
    }

    #[test]
    fn test_unknown_function() {
        let err = call("system", &args(&["rm -rf /"]), None).unwrap_err();
        assert!(err.contains("unknown function"));
    }

    #[test]
    fn test_wrong_arity() {
        let err = call("trim", &args(&["a", "b"]), None).unwrap_err();
        assert!(err.contains("expects 1"));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("trim", &args(&["  x  "]), None).unwrap(), "x");
        assert_eq!(call("length", &args(&["héllo"]), None).unwrap(), "5");
    }

    #[test]
    fn test_file_functions_relative_to_working_dir() {
        let temp_dir = tempdir().unwrap();
        let dir = Some(temp_dir.path());

        call("create_folder", &args(&["out/nested"]), dir).unwrap();
        assert!(temp_dir.path().join("out/nested").is_dir());

        call("append_file", &args(&["out/list.txt", "a.com"]), dir).unwrap();
        call("append_file", &args(&["out/list.txt", ""]), dir).unwrap();
        call("append_file", &args(&["out/list.txt", "b.com"]), dir).unwrap();

        assert_eq!(call("file_exists", &args(&["out/list.txt"]), dir).unwrap(), "true");
        assert_eq!(call("file_length", &args(&["out/list.txt"]), dir).unwrap(), "2");
        assert_eq!(
            call("read_file", &args(&["out/list.txt"]), dir).unwrap(),
            "a.com\n\nb.com\n"
        );

        assert_eq!(call("remove_file", &args(&["out/list.txt"]), dir).unwrap(), "true");
        assert_eq!(call("remove_file", &args(&["out/list.txt"]), dir).unwrap(), "false");
        assert_eq!(call("file_exists", &args(&["out/list.txt"]), dir).unwrap(), "false");
    }

    #[test]
    fn test_file_length_missing_file() {
        assert_eq!(call("file_length", &args(&["/nonexistent/file"]), None).unwrap(), "0");
    }

    #[test]
    fn test_read_missing_file_fails() {
        assert!(call("read_file", &args(&["/nonexistent/file"]), None).is_err());
    }
}
