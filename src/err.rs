//! Kernel-wide error taxonomy.
//!
//! System-call handlers return these as negative numbers in the ABI result
//! register; internal functions propagate them as `Result`s.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Invalid process id, or the caller lacks permission over it.
    BadEnv,
    /// The process table is exhausted.
    NoFreeEnv,
    /// The frame allocator failed even after reclaim and the OOM killer.
    NoMem,
    /// Unknown system-call number.
    NoSys,
    /// Malformed arguments: unmapped address, overlap, oversize.
    Invalid,
}

pub type KResult<T> = Result<T, KernelError>;

impl KernelError {
    /// ABI encoding: negative values in the first result register.
    pub fn code(self) -> i64 {
        match self {
            KernelError::BadEnv => -2,
            KernelError::Invalid => -3,
            KernelError::NoMem => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::NoSys => -6,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::BadEnv => "bad environment id or permission",
            KernelError::NoFreeEnv => "process table exhausted",
            KernelError::NoMem => "out of memory",
            KernelError::NoSys => "no such system call",
            KernelError::Invalid => "invalid argument",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            KernelError::BadEnv,
            KernelError::NoFreeEnv,
            KernelError::NoMem,
            KernelError::NoSys,
            KernelError::Invalid,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
