//! Spawning a command on a fresh pseudo-terminal.
//!
//! `virsh console`, `vmx.sh --console` and the rsync/ssh password prompt all
//! insist on a controlling terminal, so plain pipes won't do.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use crate::executor::HostCommand;

/// Terminal width handed to the guest, wide enough that pasted
/// configuration lines don't wrap.
const COLUMNS: u16 = 512;
const ROWS: u16 = 50;

/// Spawn `cmd` with a pty as its stdin/stdout/stderr and controlling
/// terminal. Returns the master side and the child.
pub fn spawn(cmd: &HostCommand) -> io::Result<(File, Child)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut size = libc::winsize {
        ws_row: ROWS,
        ws_col: COLUMNS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: out-pointers are valid for the duration of the call; name and
    // termios are optional and passed as null.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null(),
            &mut size,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: openpty succeeded, both descriptors are open and owned by us.
    let master = unsafe { File::from_raw_fd(master) };
    let slave = unsafe { File::from_raw_fd(slave) };

    // The child must not inherit the master.
    // SAFETY: plain fcntl on a descriptor we own.
    unsafe {
        libc::fcntl(master.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
    }

    let mut command = cmd.to_command();
    command
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));

    // SAFETY: only async-signal-safe libc calls between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    // Close our copies of the slave, otherwise reads on the master never see
    // the child hang up.
    drop(command);

    Ok((master, child))
}

/// Forward everything read from `source` as text chunks until EOF or error.
///
/// Linux reports a hung-up pty master as EIO rather than EOF; both end the
/// stream.
pub fn spawn_reader<R: Read + Send + 'static>(source: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || reader_thread(source, tx));
    rx
}

fn reader_thread<R: Read>(mut source: R, tx: Sender<String>) {
    let mut buf = [0u8; 4096];
    // Bytes of a character cut off by the previous read.
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match source.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let complete = pending.len() - incomplete_tail(&pending);
                let chunk = String::from_utf8_lossy(&pending[..complete]).into_owned();
                pending.drain(..complete);
                if !chunk.is_empty() && tx.send(chunk).is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// Length of a UTF-8 sequence at the end of `bytes` that is still missing
/// continuation bytes.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
