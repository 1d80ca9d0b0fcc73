use std::sync::Arc;

use verbs_harness::harness::{PortGid, VerbsHelperSuite};
use verbs_harness::ibverbs::device_context::DeviceContext;

/// Open the first usable device, `None` on hosts without RDMA hardware.
pub fn open_device(suite: &VerbsHelperSuite) -> Option<(Arc<DeviceContext>, PortGid)> {
    let ctx = match suite.open_device(false) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("skipping: {err}");
            return None;
        },
    };
    let local = suite.get_local_port_gid(&ctx).ok()?;
    Some((ctx, local))
}
