//! Minimal concrete `SandboxFactory`: spawns the configured sandbox image
//! as a local child process wired to stdin/stdout. The container-platform
//! client itself is a declared non-goal of the core; this is the lightest
//! adapter that makes the worker runnable end to end without one.

use async_trait::async_trait;
use dispatch_core::error::{DispatchError, DispatchResult};
use dispatch_core::{PipeSandboxIo, SandboxFactory, SandboxIo};
use tokio::process::{Child, Command};

pub struct ProcessSandboxFactory {
    image: String,
}

impl ProcessSandboxFactory {
    pub fn new(image: impl Into<String>) -> Self {
        Self { image: image.into() }
    }
}

struct ChildSandboxIo {
    child: Child,
    inner: PipeSandboxIo<tokio::process::ChildStdin, tokio::process::ChildStdout>,
}

#[async_trait]
impl SandboxFactory for ProcessSandboxFactory {
    async fn create(&self) -> DispatchResult<Box<dyn SandboxIo>> {
        let mut child = Command::new(&self.image)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::SandboxDead(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| DispatchError::SandboxDead("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| DispatchError::SandboxDead("no stdout".into()))?;

        Ok(Box::new(ChildSandboxIo {
            child,
            inner: PipeSandboxIo::new(stdin, stdout),
        }))
    }
}

#[async_trait]
impl SandboxIo for ChildSandboxIo {
    async fn write_context(&mut self, context: &str) -> DispatchResult<()> {
        self.inner.write_context(context).await
    }

    async fn read_record(&mut self, timeout: std::time::Duration) -> DispatchResult<Option<dispatch_core::SandboxRecord>> {
        self.inner.read_record(timeout).await
    }

    async fn kill(&mut self) -> DispatchResult<()> {
        self.inner.kill().await?;
        let _ = self.child.start_kill();
        Ok(())
    }
}
