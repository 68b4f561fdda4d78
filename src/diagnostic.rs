//! Fatal-error channel and rank-tagged output.
//!
//! Every unrecoverable condition in the runtime funnels through
//! [`fatal_error`], which prints a uniform diagnostic (rank, host,
//! function, file:line, message) on standard error and then aborts the
//! process. Recoverable failures use the error types in [`crate::error`].

use std::sync::atomic::{AtomicIsize, Ordering};

// Rank identity for diagnostics only. Set once at init; -1 means the
// runtime has not been initialized on this process (or this process hosts
// an in-process cluster, in which case per-message tagging uses the
// issuing runtime's rank instead).
pub(crate) static DIAG_RANK: AtomicIsize = AtomicIsize::new(-1);

pub(crate) fn set_diag_rank(rank: usize) {
    DIAG_RANK.store(rank as isize, Ordering::Relaxed);
}

fn host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Print a structured fatal diagnostic on stderr and abort the process.
///
/// `rank` overrides the process-wide diagnostic rank when known (an
/// in-process cluster hosts several ranks, so the ambient value is
/// ambiguous there).
pub fn fatal_error(
    msg: &str,
    title: &str,
    func: &str,
    file: &str,
    line: u32,
    rank: Option<usize>,
) -> ! {
    let rule = "/".repeat(70);
    let mut out = String::new();
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("tessera {}:\n", title));
    match rank {
        Some(r) => out.push_str(&format!(" on rank {} ({})\n", r, host())),
        None => {
            let r = DIAG_RANK.load(Ordering::Relaxed);
            if r >= 0 {
                out.push_str(&format!(" on rank {} ({})\n", r, host()));
            } else {
                out.push_str(&format!(" on rank *unknown* ({})\n", host()));
            }
        }
    }
    out.push_str(&format!(" at {}:{}\n", file, line));
    if !func.is_empty() {
        out.push_str(&format!(" in function: {}\n", func));
    }
    if !msg.is_empty() {
        out.push('\n');
        out.push_str(msg);
        out.push('\n');
    }
    out.push_str(&rule);
    out.push('\n');
    eprintln!("{}", out);
    std::process::abort();
}

/// Fatal error with the standard "fatal error" title.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::diagnostic::fatal_error(
            &format!($($arg)*),
            "fatal error",
            module_path!(),
            file!(),
            line!(),
            None,
        )
    };
}

/// Fatal error reporting misuse of a runtime API invariant.
#[macro_export]
macro_rules! misuse {
    ($($arg:tt)*) => {
        $crate::diagnostic::fatal_error(
            &format!($($arg)*),
            "misuse",
            module_path!(),
            file!(),
            line!(),
            None,
        )
    };
}

/// Rank-tagged line on stderr, for application-level diagnostics.
#[macro_export]
macro_rules! say {
    ($rt:expr, $($arg:tt)*) => {
        eprintln!("[{}] {}", $rt.rank_me(), format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_nonempty() {
        assert!(!host().is_empty());
    }
}
