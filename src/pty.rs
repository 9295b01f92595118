use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("child process already taken")]
    ChildTaken,
}

pub type PtyChild = Box<dyn portable_pty::Child + Send + Sync>;

/// Build the command for a terminal session.
///
/// `None` starts a login shell: `shell`, else `$SHELL`, else `/bin/sh`.
pub fn session_command(
    command: Option<&[String]>,
    shell: Option<&str>,
    working_directory: &Path,
) -> CommandBuilder {
    let mut cmd = match command {
        Some([program, args @ ..]) => {
            let mut cmd = CommandBuilder::new(program);
            cmd.args(args);
            cmd
        }
        _ => {
            let shell = shell
                .map(str::to_string)
                .or_else(|| std::env::var("SHELL").ok())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string());
            let mut cmd = CommandBuilder::new(shell);
            cmd.arg("-l");
            cmd
        }
    };
    cmd.cwd(working_directory);
    cmd.env("TERM", "xterm-256color");
    cmd
}

pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<PtyChild>,
}

impl Pty {
    pub fn spawn(rows: u16, cols: u16, cmd: CommandBuilder) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        // Keeping the slave open would hold the reader open after the child
        // exits.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.process_id())
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Hand the child to the exit monitor. Only succeeds once.
    pub fn take_child(&mut self) -> Result<PtyChild, PtyError> {
        self.child.take().ok_or(PtyError::ChildTaken)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }
}
