//! Tool execution (spec §6): run an external command inside a fresh
//! output directory, capturing its streams as content-addressed values.
//! A non-zero exit code is data the caller inspects, never an `Err`.

use std::fs::File;
use std::io;
use std::process::{Command, Stdio};

use thiserror::Error;

use buildhash_cas::CasStore;
use buildhash_fs::{make_output_dir, Blob, FsError, FsValue, Mode, Roots};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("tool produced an output directory with no tree at its root")]
    NoOutputTree,
}

/// The captured result of running a tool: the output directory's snapshot,
/// its stdout/stderr as blobs, and the process exit code.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub tree: FsValue,
    pub stdout: Blob,
    pub stderr: Blob,
    pub exit_code: i32,
}

/// Run `program(args)` with `cwd` set to a fresh `make_output_dir()`
/// directory, redirecting stdin to `/dev/null` and stdout/stderr to files
/// in that directory. Returns the directory's tree plus the captured
/// streams; the exit code is reported, never turned into an `Err`.
pub fn run_tool(roots: &Roots, cas: &CasStore, program: &str, args: &[String]) -> Result<ToolRun, ToolError> {
    let out_dir = make_output_dir(roots)?;

    let stdout_path = out_dir.join("stdout");
    let stderr_path = out_dir.join("stderr");
    let stdout_file = File::create(&stdout_path)?;
    let stderr_file = File::create(&stderr_path)?;

    let status = Command::new(program)
        .args(args)
        .current_dir(&out_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        .status()?;

    let stdout_bytes = std::fs::read(&stdout_path)?;
    let stderr_bytes = std::fs::read(&stderr_path)?;
    std::fs::remove_file(&stdout_path)?;
    std::fs::remove_file(&stderr_path)?;

    let stdout = Blob::from_bytes(stdout_bytes, Mode::Regular);
    let stderr = Blob::from_bytes(stderr_bytes, Mode::Regular);

    let path = buildhash_fs::Path::new(buildhash_fs::Root::Abs, out_dir.to_string_lossy().into_owned());
    let tree = path
        .tree(roots, cas)?
        .ok_or(ToolError::NoOutputTree)?;

    Ok(ToolRun {
        tree,
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn roots(tmp: &std::path::Path) -> Roots {
        Roots {
            src_root: tmp.join("src"),
            gen_root: tmp.join("gen"),
            out_root: tmp.join("out"),
            cas_root: tmp.join("cas"),
        }
    }

    #[test]
    fn successful_command_captures_stdout_and_exit_zero() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        std::fs::create_dir_all(&r.gen_root).unwrap();
        let cas = CasStore::open(&r.cas_root).unwrap();

        let run = run_tool(&r, &cas, "/bin/echo", &["hello".to_string()]).unwrap();
        assert_eq!(run.exit_code, 0);
        assert_eq!(run.stdout.bytes(&cas).unwrap(), b"hello\n");
        assert!(run.stderr.bytes(&cas).unwrap().is_empty());
    }

    #[test]
    fn nonzero_exit_is_reported_not_an_error() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        std::fs::create_dir_all(&r.gen_root).unwrap();
        let cas = CasStore::open(&r.cas_root).unwrap();

        let run = run_tool(&r, &cas, "/bin/sh", &["-c".to_string(), "exit 7".to_string()]).unwrap();
        assert_eq!(run.exit_code, 7);
    }

    #[test]
    fn tool_output_files_are_visible_in_the_returned_tree() {
        let tmp = tempdir().unwrap();
        let r = roots(tmp.path());
        std::fs::create_dir_all(&r.gen_root).unwrap();
        let cas = CasStore::open(&r.cas_root).unwrap();

        let run = run_tool(
            &r,
            &cas,
            "/bin/sh",
            &["-c".to_string(), "echo hi > result.txt".to_string()],
        )
        .unwrap();
        match run.tree {
            FsValue::Tree(t) => assert!(t.entries().contains_key("result.txt")),
            FsValue::Blob(_) => panic!("expected tree"),
        }
    }
}
