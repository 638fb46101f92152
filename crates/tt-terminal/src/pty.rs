// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

// PTY-backed terminal running a shell or program for a single test
//
// Uses portable-pty for the child and a background reader thread that feeds
// the vt100 screen and, when tracing, the trace recorder.

use crate::keys::Key;
use crate::screen::{BufferScope, CursorPosition, Grid, ScreenSource, VirtualScreen};
use crate::trace::TraceRecorder;
use crate::{TerminalError, TerminalResult};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};
use tt_config::{Program, ResolvedOptions, Shell};

const READ_BUFFER_SIZE: usize = 8192;

/// Prompt installed in shells started without a program
pub const SHELL_PROMPT: &str = "> ";

#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub shell: Shell,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
    pub program: Option<Program>,
    pub cwd: Option<PathBuf>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            shell: Shell::default(),
            rows: tt_config::DEFAULT_ROWS,
            cols: tt_config::DEFAULT_COLUMNS,
            env: BTreeMap::new(),
            program: None,
            cwd: None,
        }
    }
}

impl From<ResolvedOptions> for TerminalOptions {
    fn from(o: ResolvedOptions) -> Self {
        Self {
            shell: o.shell,
            rows: o.rows,
            cols: o.columns,
            env: o.env,
            program: o.program,
            cwd: None,
        }
    }
}

/// Executable and arguments for a shell started without user rc files.
fn shell_command(shell: Shell) -> (String, Vec<String>) {
    let exe = if cfg!(windows) {
        format!("{}.exe", shell.name())
    } else {
        shell.name().to_string()
    };
    let args: Vec<&str> = match shell {
        Shell::Bash => vec!["--norc", "--noprofile"],
        Shell::Zsh => vec!["-f"],
        Shell::Fish => vec!["--no-config"],
        Shell::Powershell => vec!["-NoLogo", "-NoProfile", "-NoExit"],
        Shell::Pwsh => vec!["-NoLogo", "-NoProfile", "-NoExit"],
        Shell::Sh | Shell::Cmd => Vec::new(),
    };
    (exe, args.into_iter().map(String::from).collect())
}

fn build_command(options: &TerminalOptions) -> TerminalResult<CommandBuilder> {
    let mut cmd = match &options.program {
        Some(program) => {
            let path = which::which(&program.file)
                .map_err(|_| TerminalError::ProgramNotFound(program.file.clone()))?;
            let mut cmd = CommandBuilder::new(path);
            cmd.args(&program.args);
            cmd
        }
        None => {
            let (exe, args) = shell_command(options.shell);
            let path = which::which(&exe).map_err(|_| TerminalError::ProgramNotFound(exe))?;
            let mut cmd = CommandBuilder::new(path);
            cmd.args(&args);
            match options.shell {
                Shell::Cmd => cmd.env("PROMPT", "$G$S"),
                Shell::Zsh => cmd.env("PROMPT", SHELL_PROMPT),
                _ => cmd.env("PS1", SHELL_PROMPT),
            }
            cmd
        }
    };

    cmd.env("TERM", "xterm-256color");
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &options.cwd {
        cmd.cwd(cwd);
    } else if let Ok(cwd) = std::env::current_dir() {
        cmd.cwd(cwd);
    }
    Ok(cmd)
}

/// Exit status of the child, filled in by the reader thread
#[derive(Default)]
struct ExitState {
    code: Mutex<Option<u32>>,
}

pub struct Terminal {
    screen: Arc<VirtualScreen>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit: Arc<ExitState>,
    recorder: Option<TraceRecorder>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Terminal {
    /// Spawn the configured shell or program under a new PTY.
    pub fn spawn(options: TerminalOptions, recorder: Option<TraceRecorder>) -> TerminalResult<Self> {
        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Pty(format!("failed to create PTY: {e}")))?;

        let cmd = build_command(&options)?;
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::Pty(format!("failed to spawn command in PTY: {e}")))?;
        // Only the child keeps the slave open so that reads see EOF on exit
        drop(pair.slave);

        debug!(
            shell = %options.shell,
            program = ?options.program.as_ref().map(|p| &p.file),
            rows = options.rows,
            cols = options.cols,
            "Spawned terminal"
        );

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TerminalError::Pty(format!("failed to take PTY writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TerminalError::Pty(format!("failed to create PTY reader: {e}")))?;
        let killer = child.clone_killer();

        let screen = Arc::new(VirtualScreen::new(options.rows, options.cols));
        let exit = Arc::new(ExitState::default());

        let thread_screen = Arc::clone(&screen);
        let thread_exit = Arc::clone(&exit);
        let thread_recorder = recorder.clone();
        let handle = thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            debug!("EOF on PTY reader");
                            break;
                        }
                        Ok(n) => {
                            trace!(bytes = n, "Read PTY output");
                            thread_screen.process(&buf[..n]);
                            if let Some(recorder) = &thread_recorder {
                                recorder.record_output(&buf[..n]);
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            // EIO is how Linux reports a closed slave
                            debug!(error = %e, "PTY read finished");
                            break;
                        }
                    }
                }

                match child.wait() {
                    Ok(status) => {
                        debug!(exit_code = status.exit_code(), "Child process exited");
                        if let Ok(mut code) = thread_exit.code.lock() {
                            *code = Some(status.exit_code());
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to wait for child"),
                }
            }));
            if let Err(panic) = result {
                error!("PTY reader thread panicked: {:?}", panic);
            }
        });

        Ok(Self {
            screen,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            exit,
            recorder,
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn screen(&self) -> Arc<VirtualScreen> {
        Arc::clone(&self.screen)
    }

    pub fn recorder(&self) -> Option<&TraceRecorder> {
        self.recorder.as_ref()
    }

    /// Write raw text to the terminal.
    pub fn write(&self, data: &str) -> TerminalResult<()> {
        let mut writer = self.writer.lock().map_err(|_| TerminalError::Closed)?;
        writer.write_all(data.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Write `data` followed by a carriage return.
    pub fn submit(&self, data: &str) -> TerminalResult<()> {
        self.write(&format!("{data}\r"))
    }

    pub fn press(&self, key: Key, times: usize) -> TerminalResult<()> {
        self.write(&key.repeated(times))
    }

    pub fn key_up(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Up, times)
    }

    pub fn key_down(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Down, times)
    }

    pub fn key_left(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Left, times)
    }

    pub fn key_right(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Right, times)
    }

    pub fn key_escape(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Escape, times)
    }

    pub fn key_delete(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Delete, times)
    }

    pub fn key_backspace(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::Backspace, times)
    }

    pub fn key_ctrl_c(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::CtrlC, times)
    }

    pub fn key_ctrl_d(&self, times: usize) -> TerminalResult<()> {
        self.press(Key::CtrlD, times)
    }

    /// Resize the PTY and the screen model.
    pub fn resize(&self, cols: u16, rows: u16) -> TerminalResult<()> {
        if cols == 0 || rows == 0 {
            return Err(TerminalError::InvalidSize { cols, rows });
        }
        let master = self.master.lock().map_err(|_| TerminalError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Pty(format!("failed to resize PTY: {e}")))?;
        self.screen.resize(rows, cols);
        if let Some(recorder) = &self.recorder {
            recorder.record_resize(rows, cols);
        }
        debug!(cols, rows, "Resized terminal");
        Ok(())
    }

    /// Exit code once the child has exited.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit.code.lock().ok().and_then(|c| *c)
    }

    /// Kill the child. Killing an already exited child is not an error.
    pub fn kill(&self) {
        if self.exit_code().is_some() {
            return;
        }
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                debug!(error = %e, "Kill failed, child likely already exited");
            }
        }
    }

    /// Kill the child and wait for the reader thread to drain.
    pub fn shutdown(&self) {
        self.kill();
        let handle = self.reader.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Poll until the screen shows any non-blank content or `timeout` passes.
    pub async fn wait_for_content(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let grid = self.screen.grid(BufferScope::Viewport);
            if grid.text_rows().iter().any(|row| !row.trim().is_empty()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl ScreenSource for Terminal {
    fn grid(&self, scope: BufferScope) -> Grid {
        self.screen.grid(scope)
    }

    fn cursor(&self) -> CursorPosition {
        self.screen.cursor()
    }

    fn size(&self) -> (u16, u16) {
        self.screen.size()
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.kill();
    }
}
