//! Code that runs in the forked child between `fork` and `execve`.
//!
//! Only async-signal-safe libc calls are allowed here: no allocation, no
//! locks, no logging. Everything the child needs is prepared by the parent
//! in an [`ExecPlan`] before forking. Failures are written to the error pipe
//! as a fixed 8-byte record (stage u32, errno i32, both big-endian).

use libc::{c_char, c_int};
use nix::errno::Errno;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;

pub(crate) const ERROR_RECORD_LEN: usize = 8;

/// Status the child exits with when setup fails. The reported exit code is
/// derived from the error record, not from this value.
const CHILD_SETUP_EXIT: c_int = 127;

/// Step of child setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SetupStage {
    Setpgid = 1,
    Dup = 2,
    Groups = 3,
    Setgid = 4,
    Setuid = 5,
    Chdir = 6,
    Exec = 7,
}

impl SetupStage {
    pub fn from_u32(value: u32) -> Option<Self> {
        let stage = match value {
            1 => SetupStage::Setpgid,
            2 => SetupStage::Dup,
            3 => SetupStage::Groups,
            4 => SetupStage::Setgid,
            5 => SetupStage::Setuid,
            6 => SetupStage::Chdir,
            7 => SetupStage::Exec,
            _ => return None,
        };
        Some(stage)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SetupStage::Setpgid => "setpgid",
            SetupStage::Dup => "dup2",
            SetupStage::Groups => "setgroups",
            SetupStage::Setgid => "setgid",
            SetupStage::Setuid => "setuid",
            SetupStage::Chdir => "chdir",
            SetupStage::Exec => "execve",
        }
    }
}

impl std::fmt::Display for SetupStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result read from the error pipe by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The pipe closed without a record: exec succeeded.
    Started,
    Failed { stage: SetupStage, errno: Errno },
}

impl ExecOutcome {
    pub(crate) fn decode(record: &[u8]) -> Self {
        match record.len() {
            0 => ExecOutcome::Started,
            ERROR_RECORD_LEN => {
                let stage = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
                let errno = i32::from_be_bytes([record[4], record[5], record[6], record[7]]);
                ExecOutcome::Failed {
                    stage: SetupStage::from_u32(stage).unwrap_or(SetupStage::Exec),
                    errno: Errno::from_raw(errno),
                }
            }
            // Child died mid-write.
            _ => ExecOutcome::Failed {
                stage: SetupStage::Exec,
                errno: Errno::EIO,
            },
        }
    }
}

fn encode_record(stage: SetupStage, errno: i32) -> [u8; ERROR_RECORD_LEN] {
    let mut record = [0u8; ERROR_RECORD_LEN];
    record[..4].copy_from_slice(&(stage as u32).to_be_bytes());
    record[4..].copy_from_slice(&errno.to_be_bytes());
    record
}

/// Identity switch performed by the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Privileges {
    /// Already running as the requested user.
    Keep,
    Drop {
        uid: libc::uid_t,
        gid: libc::gid_t,
        groups: Vec<libc::gid_t>,
    },
    /// No passwd entry for the requested uid.
    UnknownUser,
}

/// Everything the child needs, laid out before fork.
pub(crate) struct ExecPlan {
    path: CString,
    // Owners of the strings the pointer arrays reference.
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
    cwd: Option<CString>,
    privileges: Privileges,
}

impl ExecPlan {
    pub(crate) fn new(
        path: CString,
        argv: Vec<CString>,
        envp: Vec<CString>,
        cwd: Option<CString>,
        privileges: Privileges,
    ) -> Self {
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Self {
            path,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
            cwd,
            privileges,
        }
    }

    pub(crate) fn path(&self) -> &CString {
        &self.path
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Descriptors the child wires onto 0/1/2, plus the error pipe.
pub(crate) struct ChildFds<'a> {
    pub stdin: &'a OwnedFd,
    pub stdout: &'a OwnedFd,
    pub stderr: &'a OwnedFd,
    pub error: &'a OwnedFd,
}

/// Child side of a launch. Never returns.
///
/// # Safety
///
/// Must only be called in the child immediately after `fork`.
pub(crate) unsafe fn run_child(plan: &ExecPlan, fds: &ChildFds<'_>) -> ! {
    let err_fd = fds.error.as_raw_fd();
    unsafe {
        // The daemon blocks its shutdown signals and Rust ignores SIGPIPE;
        // neither may leak into the task.
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        if libc::setpgid(0, 0) < 0 {
            fail(err_fd, SetupStage::Setpgid);
        }

        for (fd, target) in [
            (fds.stdin.as_raw_fd(), libc::STDIN_FILENO),
            (fds.stdout.as_raw_fd(), libc::STDOUT_FILENO),
            (fds.stderr.as_raw_fd(), libc::STDERR_FILENO),
        ] {
            if wire_fd(fd, target) < 0 {
                fail(err_fd, SetupStage::Dup);
            }
        }

        match &plan.privileges {
            Privileges::Keep => {}
            Privileges::UnknownUser => fail_with(err_fd, SetupStage::Groups, libc::ENOENT),
            Privileges::Drop { uid, gid, groups } => {
                if libc::setgroups(groups.len() as _, groups.as_ptr()) < 0 {
                    fail(err_fd, SetupStage::Groups);
                }
                if libc::setgid(*gid) < 0 {
                    fail(err_fd, SetupStage::Setgid);
                }
                if libc::setuid(*uid) < 0 {
                    fail(err_fd, SetupStage::Setuid);
                }
            }
        }

        if let Some(cwd) = &plan.cwd
            && libc::chdir(cwd.as_ptr()) < 0
        {
            fail(err_fd, SetupStage::Chdir);
        }

        libc::execve(
            plan.path.as_ptr(),
            plan.argv_ptrs.as_ptr(),
            plan.envp_ptrs.as_ptr(),
        );
        fail(err_fd, SetupStage::Exec)
    }
}

/// Make `fd` available as `target` across exec. When the pipe already sits
/// on `target`, dup2 is a no-op and would leave close-on-exec set.
fn wire_fd(fd: RawFd, target: RawFd) -> c_int {
    if fd == target {
        // SAFETY: plain fcntl on a descriptor we own.
        unsafe { libc::fcntl(fd, libc::F_SETFD, 0) }
    } else {
        // SAFETY: plain dup2 between descriptors we own.
        retry(|| unsafe { libc::dup2(fd, target) })
    }
}

fn retry(mut op: impl FnMut() -> c_int) -> c_int {
    loop {
        let rc = op();
        if rc >= 0 || Errno::last_raw() != libc::EINTR {
            return rc;
        }
    }
}

fn fail(err_fd: RawFd, stage: SetupStage) -> ! {
    fail_with(err_fd, stage, Errno::last_raw())
}

fn fail_with(err_fd: RawFd, stage: SetupStage, errno: i32) -> ! {
    let record = encode_record(stage, errno);
    let mut diag = [0u8; 96];
    let len = format_diagnostic(&mut diag, stage, errno);
    unsafe {
        libc::write(err_fd, record.as_ptr().cast(), record.len());
        // fd 2 may still be the daemon's stderr if dup2 failed.
        libc::write(libc::STDERR_FILENO, diag.as_ptr().cast(), len);
        libc::_exit(CHILD_SETUP_EXIT)
    }
}

/// `nagent: <stage> failed: errno <n>\n` without allocating.
fn format_diagnostic(buf: &mut [u8], stage: SetupStage, errno: i32) -> usize {
    let mut len = 0;
    let mut put = |bytes: &[u8], len: &mut usize| {
        let n = bytes.len().min(buf.len() - *len);
        buf[*len..*len + n].copy_from_slice(&bytes[..n]);
        *len += n;
    };
    put(b"nagent: ", &mut len);
    put(stage.as_str().as_bytes(), &mut len);
    put(b" failed: errno ", &mut len);

    let mut digits = [0u8; 11];
    let mut value = errno.unsigned_abs();
    let mut start = digits.len();
    loop {
        start -= 1;
        digits[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    if errno < 0 {
        put(b"-", &mut len);
    }
    put(&digits[start..], &mut len);
    put(b"\n", &mut len);
    len
}
