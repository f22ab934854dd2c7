//! Multi-process start-up via `fork`.

use std::collections::HashMap;
use std::io;

use tracing::{info, warn};

/// Forks worker processes and returns each worker's task id.
///
/// `num_processes` of 0 forks one worker per detected CPU core; any other
/// value forks exactly that many. Each child returns its task id
/// (`0..count`) and should then build its own reactor and serve. The
/// parent stays behind to supervise: it waits for every child and exits
/// the process once the last one is gone, so code after this call only
/// runs in workers.
///
/// Because the children share nothing but the inherited listening sockets,
/// no reactor may be created before calling this.
pub fn fork_processes(num_processes: usize) -> io::Result<usize> {
    let count = if num_processes == 0 {
        num_cpus::get()
    } else {
        num_processes
    };
    info!("forking {} worker processes", count);

    let mut children: HashMap<libc::pid_t, usize> = HashMap::with_capacity(count);
    for task_id in 0..count {
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => return Ok(task_id),
            pid => {
                children.insert(pid, task_id);
            }
        }
    }

    while !children.is_empty() {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::wait(&mut status) };
        if pid == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        if let Some(task_id) = children.remove(&pid) {
            if status != 0 {
                warn!(
                    "worker {} (pid {}) exited with status {}",
                    task_id, pid, status
                );
            }
        }
    }
    std::process::exit(0)
}
