// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Seccomp BPF deny-list installed by the wrapper after all mounts.
//!
//! The filter returns `EPERM` for syscalls that would let the agent alter
//! the mount table, trace other processes, or touch kernel state, and
//! allows everything else. Installed with no-new-privs; it must run after
//! mount setup because the filter itself denies `mount`.

use std::collections::BTreeMap;

use anyhow::Context;
use seccompiler::{SeccompAction, SeccompFilter, SeccompRule, TargetArch};

/// Syscalls denied inside the sandbox, all architectures.
const DENIED: &[i64] = &[
    nix::libc::SYS_mount,
    nix::libc::SYS_umount2,
    nix::libc::SYS_reboot,
    nix::libc::SYS_swapon,
    nix::libc::SYS_swapoff,
    nix::libc::SYS_kexec_load,
    nix::libc::SYS_init_module,
    nix::libc::SYS_finit_module,
    nix::libc::SYS_delete_module,
    nix::libc::SYS_pivot_root,
    nix::libc::SYS_ptrace,
];

/// x86-only port/LDT syscalls with no aarch64 equivalent.
#[cfg(target_arch = "x86_64")]
const DENIED_X86: &[i64] = &[
    nix::libc::SYS_iopl,
    nix::libc::SYS_ioperm,
    nix::libc::SYS_modify_ldt,
];

fn denied_syscalls() -> Vec<i64> {
    let mut list = DENIED.to_vec();
    #[cfg(target_arch = "x86_64")]
    list.extend_from_slice(DENIED_X86);
    list
}

fn target_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        TargetArch::aarch64
    }
}

/// Compile the deny-list filter to BPF.
pub fn build_filter() -> anyhow::Result<seccompiler::BpfProgram> {
    // Empty rule vectors match the syscall unconditionally.
    let rules: BTreeMap<i64, Vec<SeccompRule>> =
        denied_syscalls().into_iter().map(|nr| (nr, vec![])).collect();

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(nix::libc::EPERM as u32),
        target_arch(),
    )
    .context("building seccomp filter")?;

    filter.try_into().context("compiling seccomp filter to BPF")
}

/// Set no-new-privs and install the filter on the current process.
pub fn install() -> anyhow::Result<()> {
    let bpf = build_filter()?;
    nix::sys::prctl::set_no_new_privs().context("PR_SET_NO_NEW_PRIVS")?;
    seccompiler::apply_filter(&bpf).context("installing seccomp filter")?;
    Ok(())
}

#[cfg(test)]
#[path = "seccomp_tests.rs"]
mod tests;
