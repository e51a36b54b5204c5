//! Point-hit notifications delivered by the attachment layer
//!
//! The attachment layer calls [`crate::engine::Engine::on_point`] synchronously
//! on the traced thread, once per actual entry or return of an instrumented
//! function. Object views and the return value are only valid for the
//! duration of that call. On return edges the entry arguments are supplied
//! again, the way fexit programs see them.

use crate::call_record::TASK_COMM_LEN;
use crate::layout::ObjectView;
use crate::probes::ProbeSite;

/// Identity of the traced thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    /// `tgid << 32 | pid`, unique among concurrently outstanding calls
    pub call_id: u64,
    /// Execution context (CPU) the notification runs on
    pub cpu: u32,
    /// Calling task's comm, NUL padded
    pub task: [u8; TASK_COMM_LEN],
}

impl CallContext {
    pub fn new(call_id: u64, cpu: u32, task: &[u8]) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        crate::call_record::copy_truncated(&mut comm, task);
        CallContext {
            call_id,
            cpu,
            task: comm,
        }
    }

    /// Process id, the upper half of the call id
    pub fn pid(&self) -> u64 {
        self.call_id >> 32
    }
}

/// Live objects handed over at a probe site, by role
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeArgs<'a> {
    /// `filp->f_path.dentry` at `nfs4_file_open` entry
    pub dentry: Option<ObjectView<'a>>,
    /// `struct nfs4_opendata *`
    pub opendata: Option<ObjectView<'a>>,
    /// `opendata->o_arg.fh`
    pub fh: Option<ObjectView<'a>>,
    /// `struct nfs4_state *`
    pub state: Option<ObjectView<'a>>,
    /// `const nfs4_stateid *` argument
    pub stateid: Option<ObjectView<'a>>,
    /// `struct nfs_client *`
    pub client: Option<ObjectView<'a>>,
    /// Return value, on return edges
    pub ret: Option<i64>,
}

/// One point hit
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    pub site: ProbeSite,
    pub ctx: CallContext,
    pub args: ProbeArgs<'a>,
}

impl<'a> Notification<'a> {
    pub fn new(site: ProbeSite, ctx: CallContext) -> Self {
        Notification {
            site,
            ctx,
            args: ProbeArgs::default(),
        }
    }

    pub fn with_args(mut self, args: ProbeArgs<'a>) -> Self {
        self.args = args;
        self
    }
}
