//! Traced operation registries
//!
//! One table per probe family. The discriminant travels in the `op` field of
//! completed events, the symbol is the kernel function the probe attaches to,
//! and the program names are the exported names of the kernel-side handlers.

macro_rules! op_registry {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $sym:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every operation, in discriminant order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Kernel symbol the probes attach to
            pub const fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $sym),+
                }
            }

            /// Name of the entry (kprobe) program
            pub const fn entry_program(self) -> &'static str {
                match self {
                    $($name::$variant => concat!("trace_entry_", $sym)),+
                }
            }

            /// Name of the exit (kretprobe) program
            pub const fn exit_program(self) -> &'static str {
                match self {
                    $($name::$variant => concat!("trace_exit_", $sym)),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|op| op.name() == name)
            }

            pub const fn from_u32(v: u32) -> Option<Self> {
                if (v as usize) < Self::ALL.len() {
                    Some(Self::ALL[v as usize])
                } else {
                    None
                }
            }

            #[inline(always)]
            pub const fn as_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

op_registry! {
    /// VFS read/write entry points of the NFS client
    IoOp {
        Read => "nfs_file_read",
        Write => "nfs_file_write",
        SpliceRead => "nfs_file_splice_read",
        SpliceWrite => "iter_file_splice_write",
    }
}

impl IoOp {
    /// True for operations whose bytes count as reads
    pub const fn is_read(self) -> bool {
        matches!(self, IoOp::Read | IoOp::SpliceRead)
    }
}

op_registry! {
    /// NFS client file, inode and dentry operations
    ClientOp {
        FileMmap => "nfs_file_mmap",
        FileOpen => "nfs4_file_open",
        FileFlush => "nfs4_file_flush",
        FileRelease => "nfs_file_release",
        FileFsync => "nfs_file_fsync",
        Lock => "nfs_lock",
        Flock => "nfs_flock",
        CheckFlags => "nfs_check_flags",
        SetLease => "nfs4_setlease",
        CopyFileRange => "nfs4_copy_file_range",
        FileLlseek => "nfs4_file_llseek",
        Fallocate => "nfs42_fallocate",
        RemapFileRange => "nfs42_remap_file_range",
        Create => "nfs_create",
        Lookup => "nfs_lookup",
        AtomicOpen => "nfs_atomic_open",
        Link => "nfs_link",
        Unlink => "nfs_unlink",
        Symlink => "nfs_symlink",
        Mkdir => "nfs_mkdir",
        Rmdir => "nfs_rmdir",
        Mknod => "nfs_mknod",
        Rename => "nfs_rename",
        Permission => "nfs_permission",
        Getattr => "nfs_getattr",
        Setattr => "nfs_setattr",
        Listxattr => "nfs4_listxattr",
        LookupRevalidate => "nfs4_lookup_revalidate",
        WeakRevalidate => "nfs_weak_revalidate",
        DentryDelete => "nfs_dentry_delete",
        DentryIput => "nfs_dentry_iput",
        DAutomount => "nfs_d_automount",
        DRelease => "nfs_d_release",
    }
}

op_registry! {
    /// NFSv4 server operation handlers
    NfsdOp {
        Access => "nfsd4_access",
        Close => "nfsd4_close",
        Commit => "nfsd4_commit",
        Create => "nfsd4_create",
        Delegreturn => "nfsd4_delegreturn",
        Getattr => "nfsd4_getattr",
        Getfh => "nfsd4_getfh",
        Link => "nfsd4_link",
        Lock => "nfsd4_lock",
        Lockt => "nfsd4_lockt",
        Locku => "nfsd4_locku",
        Lookup => "nfsd4_lookup",
        Lookupp => "nfsd4_lookupp",
        Nverify => "nfsd4_nverify",
        Open => "nfsd4_open",
        OpenConfirm => "nfsd4_open_confirm",
        OpenDowngrade => "nfsd4_open_downgrade",
        Putfh => "nfsd4_putfh",
        Putrootfh => "nfsd4_putrootfh",
        Read => "nfsd4_read",
        Readdir => "nfsd4_readdir",
        Readlink => "nfsd4_readlink",
        Remove => "nfsd4_remove",
        Rename => "nfsd4_rename",
        Renew => "nfsd4_renew",
        Restorefh => "nfsd4_restorefh",
        Savefh => "nfsd4_savefh",
        Secinfo => "nfsd4_secinfo",
        Setattr => "nfsd4_setattr",
        Setclientid => "nfsd4_setclientid",
        SetclientidConfirm => "nfsd4_setclientid_confirm",
        Verify => "nfsd4_verify",
        Write => "nfsd4_write",
        ReleaseLockowner => "nfsd4_release_lockowner",
        ExchangeId => "nfsd4_exchange_id",
        BackchannelCtl => "nfsd4_backchannel_ctl",
        BindConnToSession => "nfsd4_bind_conn_to_session",
        CreateSession => "nfsd4_create_session",
        DestroySession => "nfsd4_destroy_session",
        Sequence => "nfsd4_sequence",
        DestroyClientid => "nfsd4_destroy_clientid",
        ReclaimComplete => "nfsd4_reclaim_complete",
        SecinfoNoName => "nfsd4_secinfo_no_name",
        TestStateid => "nfsd4_test_stateid",
        FreeStateid => "nfsd4_free_stateid",
        Getdeviceinfo => "nfsd4_getdeviceinfo",
        Layoutget => "nfsd4_layoutget",
        Layoutcommit => "nfsd4_layoutcommit",
        Layoutreturn => "nfsd4_layoutreturn",
        Allocate => "nfsd4_allocate",
        Deallocate => "nfsd4_deallocate",
        CloneRange => "nfsd4_clone",
        CopyRange => "nfsd4_copy",
        Seek => "nfsd4_seek",
        OffloadStatus => "nfsd4_offload_status",
        OffloadCancel => "nfsd4_offload_cancel",
        CopyNotify => "nfsd4_copy_notify",
        Getxattr => "nfsd4_getxattr",
        Setxattr => "nfsd4_setxattr",
        Listxattrs => "nfsd4_listxattrs",
        Removexattr => "nfsd4_removexattr",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_sizes() {
        assert_eq!(IoOp::ALL.len(), 4);
        assert_eq!(ClientOp::ALL.len(), 33);
        assert_eq!(NfsdOp::ALL.len(), 61);
    }

    #[test]
    fn test_discriminants_follow_table_order() {
        for (i, op) in NfsdOp::ALL.iter().enumerate() {
            assert_eq!(op.as_u32() as usize, i);
            assert_eq!(NfsdOp::from_u32(i as u32), Some(*op));
        }
        assert_eq!(NfsdOp::from_u32(61), None);
    }

    #[test]
    fn test_lookup_by_symbol() {
        assert_eq!(ClientOp::from_name("nfs_permission"), Some(ClientOp::Permission));
        assert_eq!(IoOp::from_name("iter_file_splice_write"), Some(IoOp::SpliceWrite));
        assert_eq!(NfsdOp::from_name("nfsd4_compound"), None);
    }

    #[test]
    fn test_program_names() {
        assert_eq!(IoOp::Read.entry_program(), "trace_entry_nfs_file_read");
        assert_eq!(NfsdOp::Sequence.exit_program(), "trace_exit_nfsd4_sequence");
        assert_eq!(ClientOp::DRelease.exit_program(), "trace_exit_nfs_d_release");
    }

    #[test]
    fn test_symbols_are_unique() {
        for (i, a) in ClientOp::ALL.iter().enumerate() {
            for b in &ClientOp::ALL[i + 1..] {
                assert_ne!(a.name(), b.name());
            }
        }
    }
}
