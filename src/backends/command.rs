//! Compiler adapter that shells out to an external command.
//!
//! The bundle is written to `<scratch>/<uuid>/src`, the command runs with
//! `{src}` and `{out}` substituted into its arguments, and whatever it leaves
//! at `{out}` becomes the artifact. The child is killed if the compile
//! future is dropped, which is how the cache's deadline stops it.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use axum::body::Bytes;
use compile_common::{ProgressMessage, ProgressSink, SourceReference};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CompiledArtifact, Compiler, ScratchDir, SourceBundle};
use crate::errors::BuildError;

/// Stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandCompiler {
    command: String,
    args: Vec<String>,
    content_type: String,
    scratch: PathBuf,
}

impl CommandCompiler {
    pub fn new(command: &str, args: Vec<String>, content_type: &str, scratch: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            args,
            content_type: content_type.to_string(),
            scratch,
        }
    }

    fn expand_args(&self, src: &Path, out: &Path) -> Vec<String> {
        let src = src.to_string_lossy();
        let out = out.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{src}", &src).replace("{out}", &out))
            .collect()
    }
}

/// Write every file of `bundle` under `dir`, refusing names that leave it.
async fn materialize(dir: &Path, bundle: &SourceBundle) -> Result<(), BuildError> {
    for (name, content) in &bundle.files {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BuildError::CompileFailed(format!(
                "invalid source file name '{}'",
                name
            )));
        }
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BuildError::CompileFailed(format!("scratch dir: {}", e)))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| BuildError::CompileFailed(format!("writing {}: {}", name, e)))?;
    }
    Ok(())
}

async fn forward_stdout(stdout: impl AsyncRead + Unpin, progress: &ProgressSink) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            progress.emit(ProgressMessage::compiling(line));
        }
    }
}

async fn stderr_tail(stderr: impl AsyncRead + Unpin) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[async_trait]
impl Compiler for CommandCompiler {
    async fn compile(
        &self,
        reference: &SourceReference,
        source: &SourceBundle,
        progress: &ProgressSink,
    ) -> Result<CompiledArtifact, BuildError> {
        let work = ScratchDir(self.scratch.join(uuid::Uuid::new_v4().to_string()));
        let src_dir = work.0.join("src");
        let out = work.0.join("out");
        tokio::fs::create_dir_all(&src_dir)
            .await
            .map_err(|e| BuildError::CompileFailed(format!("scratch dir: {}", e)))?;
        materialize(&src_dir, source).await?;

        let args = self.expand_args(&src_dir, &out);
        debug!(command = %self.command, ?args, reference = %reference, "starting compiler");
        progress.emit(ProgressMessage::compiling(format!("Compiling {}", reference)));

        let mut child = Command::new(&self.command)
            .args(&args)
            .current_dir(&src_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BuildError::CompileFailed(format!("failed to start '{}': {}", self.command, e))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, tail) = tokio::join!(
            async {
                if let Some(stdout) = stdout {
                    forward_stdout(stdout, progress).await;
                }
            },
            async {
                match stderr {
                    Some(stderr) => stderr_tail(stderr).await,
                    None => String::new(),
                }
            }
        );

        let status = child
            .wait()
            .await
            .map_err(|e| BuildError::CompileFailed(e.to_string()))?;
        if !status.success() {
            warn!(reference = %reference, %status, "compiler failed");
            let message = if tail.trim().is_empty() {
                format!("compiler exited with {}", status)
            } else {
                tail
            };
            return Err(BuildError::CompileFailed(message));
        }

        let bytes = tokio::fs::read(&out).await.map_err(|e| {
            BuildError::CompileFailed(format!("compiler produced no output: {}", e))
        })?;
        Ok(CompiledArtifact {
            bytes: Bytes::from(bytes),
            content_type: self.content_type.clone(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle() -> SourceBundle {
        let mut bundle = SourceBundle::default();
        bundle
            .files
            .insert("main.go".into(), b"package main".to_vec());
        bundle
            .files
            .insert("sub/util.go".into(), b"package sub".to_vec());
        bundle
    }

    fn shell(script: &str, scratch: &Path) -> CommandCompiler {
        CommandCompiler::new(
            "sh",
            vec!["-c".into(), script.into()],
            "application/javascript",
            scratch.to_path_buf(),
        )
    }

    fn reference() -> SourceReference {
        SourceReference::from_normalized("github.com/dave/foo")
    }

    #[tokio::test]
    async fn test_compile_reads_output_and_streams_stdout() {
        let dir = TempDir::new().unwrap();
        let compiler = shell("echo step one; cat {src}/main.go {src}/sub/util.go > {out}", dir.path());
        let (sink, mut rx) = ProgressSink::channel();
        let artifact = compiler.compile(&reference(), &bundle(), &sink).await.unwrap();
        assert_eq!(artifact.bytes, Bytes::from_static(b"package mainpackage sub"));
        assert_eq!(artifact.content_type, "application/javascript");

        assert_eq!(
            rx.recv().await,
            Some(ProgressMessage::compiling("Compiling github.com/dave/foo"))
        );
        assert_eq!(rx.recv().await, Some(ProgressMessage::compiling("step one")));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let compiler = shell("echo 'main.go:1: syntax error' >&2; exit 2", dir.path());
        let err = compiler
            .compile(&reference(), &bundle(), &ProgressSink::discard())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BuildError::CompileFailed("main.go:1: syntax error".into())
        );
    }

    #[tokio::test]
    async fn test_missing_output_is_a_compile_failure() {
        let dir = TempDir::new().unwrap();
        let compiler = shell("true", dir.path());
        let err = compiler
            .compile(&reference(), &bundle(), &ProgressSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::CompileFailed(m) if m.contains("no output")));
    }

    #[tokio::test]
    async fn test_scratch_is_removed_afterwards() {
        let dir = TempDir::new().unwrap();
        let compiler = shell("cp {src}/main.go {out}", dir.path());
        compiler
            .compile(&reference(), &bundle(), &ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_escaping_file_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut evil = SourceBundle::default();
        evil.files.insert("../escape.go".into(), b"x".to_vec());
        let err = shell("true", dir.path())
            .compile(&reference(), &evil, &ProgressSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::CompileFailed(m) if m.contains("invalid source file name")));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let dir = TempDir::new().unwrap();
        let compiler = CommandCompiler::new(
            "definitely-not-a-compiler",
            vec![],
            "application/javascript",
            dir.path().to_path_buf(),
        );
        let err = compiler
            .compile(&reference(), &bundle(), &ProgressSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::CompileFailed(m) if m.contains("failed to start")));
    }
}
