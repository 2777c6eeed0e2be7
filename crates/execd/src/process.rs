//! Process capability traits and the OS-backed implementation.
//!
//! The supervisor only ever talks to a child through `Process`, so
//! tests can substitute a fake that never forks.

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::watch;

/// A running child process.
#[async_trait]
pub trait Process: Send + Sync {
    /// Process id, for logging.
    fn id(&self) -> u32;

    /// Wait until the process exits, returning its exit code
    /// (-1 when terminated by a signal).
    async fn wait(&self) -> i32;

    /// Deliver a signal to the process.
    fn signal(&self, sig: Signal) -> io::Result<()>;

    /// Forcibly terminate the process and reap it.
    async fn kill(&self);
}

/// Spawns new instances of the supervised program.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self) -> io::Result<Box<dyn Process>>;
}

/// Spawner running a program with fixed arguments, stdio inherited so
/// the daemon logs to the agent's console.
pub struct CommandSpawner {
    program: String,
    args: Vec<String>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Spawner for CommandSpawner {
    async fn spawn(&self) -> io::Result<Box<dyn Process>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pid = child.id().unwrap_or_default();
        let (tx, rx) = watch::channel(None);

        // reap on a dedicated task; exit status is broadcast so both
        // the supervisor and a concurrent stop() can await it
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = tx.send(Some(code));
        });

        Ok(Box::new(OsProcess { pid, exit: rx }))
    }
}

struct OsProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl Process for OsProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return (*rx.borrow()).unwrap_or(-1);
            }
        }
    }

    fn signal(&self, sig: Signal) -> io::Result<()> {
        kill(Pid::from_raw(self.pid as i32), sig).map_err(io::Error::from)
    }

    async fn kill(&self) {
        let _ = self.signal(Signal::SIGKILL);
        self.wait().await;
    }
}
