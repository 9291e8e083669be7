//! Kernel error kinds. Syscalls surface them as negative integers in EAX;
//! inside the kernel they travel as `Result<T, KernelError>`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
#[repr(i32)]
pub enum KernelError {
    Unspecified = 1,
    BadProc = 2,
    Invalid = 3,
    NoMem = 4,
    NoFreeProc = 5,
    Fault = 6,
    SwapFault = 7,
    InvalidElf = 8,
    Killed = 9,
    Unimplemented = 10,
}

impl KernelError {
    /// The value a failed syscall returns through EAX.
    pub const fn code(self) -> i32 {
        -(self as i32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            KernelError::Unspecified => "unspecified error",
            KernelError::BadProc => "bad process",
            KernelError::Invalid => "invalid argument",
            KernelError::NoMem => "out of memory",
            KernelError::NoFreeProc => "no free process slot",
            KernelError::Fault => "memory fault",
            KernelError::SwapFault => "swap failure",
            KernelError::InvalidElf => "invalid ELF image",
            KernelError::Killed => "process killed",
            KernelError::Unimplemented => "not implemented",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;

/// Fold a `Result` into the syscall ABI: non-negative payload or `-errno`.
pub fn as_syscall_ret(r: Result<i32>) -> i32 {
    match r {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            KernelError::Unspecified,
            KernelError::BadProc,
            KernelError::Invalid,
            KernelError::NoMem,
            KernelError::NoFreeProc,
            KernelError::Fault,
            KernelError::SwapFault,
            KernelError::InvalidElf,
            KernelError::Killed,
            KernelError::Unimplemented,
        ];
        for (i, e) in all.iter().enumerate() {
            assert!(e.code() < 0);
            for o in &all[i + 1..] {
                assert_ne!(e.code(), o.code());
            }
        }
    }

    #[test]
    fn syscall_fold() {
        assert_eq!(as_syscall_ret(Ok(42)), 42);
        assert_eq!(as_syscall_ret(Err(KernelError::NoMem)), -4);
    }
}
