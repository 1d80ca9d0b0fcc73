mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;
use verbs_harness::harness::VerbsHelperSuite;
use verbs_harness::ibverbs::memory_window::MemoryWindowType;
use verbs_harness::ibverbs::queue_pair::{SetScatterGatherEntry, WorkRequestFlags};
use verbs_harness::ibverbs::{AccessFlags, ResourceKind};

#[test]
fn pd_outlives_its_memory_regions() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, _)) = common::open_device(&suite) else {
        return Ok(());
    };

    let buf = suite.alloc_buffer(2, false)?;
    let pd = suite.alloc_pd(&ctx)?;
    let mr = suite.reg_mr(&pd, &buf, AccessFlags::LocalWrite | AccessFlags::RemoteRead)?;
    assert_eq!(mr.region_len(), buf.len());
    assert_eq!(suite.allocator().live_resources(), 2);

    let err = suite.dealloc_pd(pd).unwrap_err();
    assert_ne!(err.status(), 0);
    let pd = err.into_inner();
    assert_eq!(suite.allocator().live_resources(), 2);

    assert!(suite.dereg_mr(mr).is_ok());
    assert!(suite.dealloc_pd(pd).is_ok());
    assert_eq!(suite.allocator().live_resources(), 0);

    Ok(())
}

#[test]
fn cq_cannot_go_before_its_qp() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, _)) = common::open_device(&suite) else {
        return Ok(());
    };

    let pd = suite.alloc_pd(&ctx)?;
    let cq = suite.create_default_cq(&ctx)?;
    let qp = suite.create_qp(&pd, &cq)?;

    let err = suite.destroy_cq(cq).unwrap_err();
    assert_ne!(err.status(), 0);
    assert!(err.to_string().contains(&ResourceKind::CompletionQueue.to_string()));
    let cq = err.into_inner();

    assert!(suite.destroy_qp(qp).is_ok());
    assert!(suite.destroy_cq(cq).is_ok());
    assert!(suite.dealloc_pd(pd).is_ok());

    Ok(())
}

#[test]
fn cq_bound_to_a_completion_channel() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, _)) = common::open_device(&suite) else {
        return Ok(());
    };

    let channel = suite.create_channel(&ctx)?;
    assert!(channel.fd() >= 0);
    let cq = suite.create_cq(&ctx, 16, Some(&channel))?;
    assert!(cq.capacity() >= 16);

    let err = suite.destroy_channel(channel).unwrap_err();
    assert_ne!(err.status(), 0);
    let channel = err.into_inner();

    assert!(suite.destroy_cq(cq).is_ok());
    assert!(suite.destroy_channel(channel).is_ok());

    Ok(())
}

#[rstest]
#[case::type1(MemoryWindowType::Type1)]
#[case::type2(MemoryWindowType::Type2)]
fn memory_window_lifecycle(#[case] mw_type: MemoryWindowType) -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, _)) = common::open_device(&suite) else {
        return Ok(());
    };

    let pd = suite.alloc_pd(&ctx)?;
    let mw = match suite.alloc_mw(&pd, mw_type) {
        Ok(mw) => mw,
        // not every device implements memory windows
        Err(err) => {
            eprintln!("skipping: {err}");
            return Ok(());
        },
    };
    assert_eq!(mw.mw_type(), mw_type);
    assert!(suite.dealloc_mw(mw).is_ok());
    assert!(suite.dealloc_pd(pd).is_ok());

    Ok(())
}

#[test]
fn qp_on_a_shared_receive_queue() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let mut buf = suite.alloc_buffer(1, false)?;
    buf.as_mut_slice()[..5].copy_from_slice(b"hello");
    let half = buf.len() / 2;

    let pd = suite.alloc_pd(&ctx)?;
    let mr = suite.reg_mr(&pd, &buf, AccessFlags::LocalWrite)?;
    let cq = suite.create_default_cq(&ctx)?;
    let srq = suite.create_srq(&pd, suite.config().queue.srq_max_wr)?;
    let mut qp = suite.create_qp_with_srq(&pd, &cq, &srq)?;
    suite.set_up_self_connected_rc_qp(&mut qp, &local)?;

    unsafe { srq.post_recv(5, mr.lkey(), buf.addr() + half as u64, 5)? };
    let mut guard = qp.start_post_send();
    unsafe {
        guard
            .construct_wr(4, WorkRequestFlags::Signaled)
            .setup_send()
            .setup_sge(mr.lkey(), buf.addr(), 5)
    };
    guard.post()?;

    for _ in 0..2 {
        let wc = cq.wait_for_completion(Duration::from_secs(10))?;
        assert!(wc.is_success(), "{wc:?}");
    }
    assert_eq!(&buf.as_slice()[half..half + 5], b"hello");

    let srq = suite.destroy_srq(srq).unwrap_err().into_inner();
    assert!(suite.destroy_qp(qp).is_ok());
    assert!(suite.destroy_srq(srq).is_ok());
    assert!(suite.dereg_mr(mr).is_ok());

    Ok(())
}

#[test]
fn teardown_releases_leftovers_and_the_device() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };
    let buf = suite.alloc_buffer(1, true)?;

    {
        let pd = suite.alloc_pd(&ctx)?;
        let _mr = suite.reg_mr(&pd, &buf, AccessFlags::LocalWrite)?;
        let cq = suite.create_default_cq(&ctx)?;
        let mut qp = suite.create_qp(&pd, &cq)?;
        suite.set_up_self_connected_rc_qp(&mut qp, &local)?;
        let _ah = suite.create_ah(&pd, local.gid)?;
        let _srq = suite.create_srq(&pd, 16)?;
    }
    assert_eq!(suite.allocator().live_resources(), 6);
    assert!(Arc::strong_count(&ctx) > 1);

    drop(suite);
    assert_eq!(Arc::strong_count(&ctx), 1);
    drop(buf);

    Ok(())
}
