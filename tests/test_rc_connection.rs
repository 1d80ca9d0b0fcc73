mod common;

use std::error::Error;
use std::time::Duration;

use verbs_harness::harness::VerbsHelperSuite;
use verbs_harness::ibverbs::completion::{WorkCompletionOperationType, WorkCompletionStatus};
use verbs_harness::ibverbs::queue_pair::{
    ModifyQueuePairErrorKind, QueuePairAttribute, QueuePairAttributeMask, QueuePairState, SetScatterGatherEntry,
    WorkRequestFlags,
};
use verbs_harness::ibverbs::AccessFlags;

const TIMEOUT: Duration = Duration::from_secs(10);
const MESSAGE: &[u8] = b"verbs harness loopback payload";

#[test]
fn loopback_pair_exchanges_a_send() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let mut send_buf = suite.alloc_buffer(1, false)?;
    let recv_buf = suite.alloc_buffer(1, false)?;
    send_buf.as_mut_slice()[..MESSAGE.len()].copy_from_slice(MESSAGE);

    let pd = suite.alloc_pd(&ctx)?;
    let send_mr = suite.reg_mr(&pd, &send_buf, AccessFlags::LocalWrite)?;
    let recv_mr = suite.reg_mr(&pd, &recv_buf, AccessFlags::LocalWrite)?;
    let send_cq = suite.create_default_cq(&ctx)?;
    let recv_cq = suite.create_default_cq(&ctx)?;
    let mut qp1 = suite.create_qp(&pd, &send_cq)?;
    let mut qp2 = suite.create_qp(&pd, &recv_cq)?;
    assert_eq!(qp1.state(), QueuePairState::Reset);

    suite.set_up_loopback_rc_qps(&mut qp1, &mut qp2, &local)?;
    assert_eq!(qp1.state(), QueuePairState::ReadyToSend);
    assert_eq!(qp2.state(), QueuePairState::ReadyToSend);

    let mut guard = qp2.start_post_recv();
    unsafe { guard.construct_wr(2).setup_sge(recv_mr.lkey(), recv_buf.addr(), MESSAGE.len() as u32) };
    guard.post()?;

    let mut guard = qp1.start_post_send();
    unsafe {
        guard
            .construct_wr(1, WorkRequestFlags::Signaled)
            .setup_send()
            .setup_sge(send_mr.lkey(), send_buf.addr(), MESSAGE.len() as u32)
    };
    guard.post()?;

    let wc = send_cq.wait_for_completion(TIMEOUT)?;
    assert_eq!(wc.status(), WorkCompletionStatus::Success);
    assert_eq!(wc.wr_id(), 1);
    assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::Send));

    let wc = recv_cq.wait_for_completion(TIMEOUT)?;
    assert!(wc.is_success());
    assert_eq!(wc.wr_id(), 2);
    assert_eq!(wc.byte_len(), MESSAGE.len() as u32);
    assert_eq!(wc.qp_num(), qp2.qp_number());
    assert_eq!(&recv_buf.as_slice()[..MESSAGE.len()], MESSAGE);

    Ok(())
}

#[test]
fn self_connected_qp_receives_its_own_send() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let mut buf = suite.alloc_buffer(1, false)?;
    buf.as_mut_slice()[..MESSAGE.len()].copy_from_slice(MESSAGE);
    let half = buf.len() / 2;

    let pd = suite.alloc_pd(&ctx)?;
    let mr = suite.reg_mr(&pd, &buf, AccessFlags::LocalWrite)?;
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp = suite.create_qp(&pd, &cq)?;
    suite.set_up_self_connected_rc_qp(&mut qp, &local)?;

    let mut guard = qp.start_post_recv();
    unsafe { guard.construct_wr(20).setup_sge(mr.lkey(), buf.addr() + half as u64, MESSAGE.len() as u32) };
    guard.post()?;

    let mut guard = qp.start_post_send();
    unsafe {
        guard
            .construct_wr(10, WorkRequestFlags::Signaled)
            .setup_send_imm(0xfeed)
            .setup_sge(mr.lkey(), buf.addr(), MESSAGE.len() as u32)
    };
    guard.post()?;

    let mut wr_ids = Vec::new();
    while wr_ids.len() < 2 {
        let wc = cq.wait_for_completion(TIMEOUT)?;
        assert!(wc.is_success(), "{wc:?}");
        wr_ids.push(wc.wr_id());
    }
    wr_ids.sort_unstable();
    assert_eq!(wr_ids, [10, 20]);
    assert_eq!(&buf.as_slice()[half..half + MESSAGE.len()], MESSAGE);

    Ok(())
}

#[test]
fn rdma_write_lands_in_the_peer_buffer() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let mut src = suite.alloc_buffer(1, false)?;
    let dst = suite.alloc_aligned_buffer(1, 64)?;
    src.as_mut_slice()[..MESSAGE.len()].copy_from_slice(MESSAGE);

    let pd = suite.alloc_pd(&ctx)?;
    let src_mr = suite.reg_mr(&pd, &src, AccessFlags::LocalWrite)?;
    let dst_mr = suite.reg_mr(&pd, &dst, AccessFlags::LocalWrite | AccessFlags::RemoteWrite)?;
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp1 = suite.create_qp(&pd, &cq)?;
    let mut qp2 = suite.create_qp(&pd, &cq)?;
    suite.set_up_loopback_rc_qps(&mut qp1, &mut qp2, &local)?;

    let mut guard = qp1.start_post_send();
    unsafe {
        guard
            .construct_wr(7, WorkRequestFlags::Signaled)
            .setup_write(dst_mr.rkey(), dst.addr())
            .setup_sge(src_mr.lkey(), src.addr(), MESSAGE.len() as u32)
    };
    guard.post()?;

    let wc = cq.wait_for_completion(TIMEOUT)?;
    assert!(wc.is_success(), "{wc:?}");
    assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::Write));
    assert_eq!(&dst.as_slice()[..MESSAGE.len()], MESSAGE);

    Ok(())
}

#[test]
fn error_state_flushes_posted_receives() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let buf = suite.alloc_buffer(1, false)?;
    let pd = suite.alloc_pd(&ctx)?;
    let mr = suite.reg_mr(&pd, &buf, AccessFlags::LocalWrite)?;
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp = suite.create_qp(&pd, &cq)?;
    suite.set_up_self_connected_rc_qp(&mut qp, &local)?;

    let mut guard = qp.start_post_recv();
    unsafe { guard.construct_wr(99).setup_sge(mr.lkey(), buf.addr(), 64) };
    guard.post()?;

    suite.set_qp_error(&mut qp)?;
    assert_eq!(qp.state(), QueuePairState::Error);

    let wc = cq.wait_for_completion(TIMEOUT)?;
    assert_eq!(wc.wr_id(), 99);
    assert_eq!(wc.status(), WorkCompletionStatus::WorkRequestFlushedError);

    Ok(())
}

#[test]
fn error_is_reachable_from_every_setup_step() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let pd = suite.alloc_pd(&ctx)?;
    let cq = suite.create_default_cq(&ctx)?;

    for steps in 0..=3 {
        let mut qp = suite.create_qp(&pd, &cq)?;
        let qpn = qp.qp_number();
        if steps >= 1 {
            suite.set_qp_init(&mut qp, local.port)?;
        }
        if steps >= 2 {
            suite.set_qp_rtr(&mut qp, &local, local.gid, qpn)?;
        }
        if steps >= 3 {
            suite.set_qp_rts(&mut qp)?;
        }

        suite.set_qp_error(&mut qp)?;
        assert_eq!(qp.state(), QueuePairState::Error);
        assert!(suite.destroy_qp(qp).is_ok());
    }

    Ok(())
}

#[test]
fn failed_recipe_leaves_the_qp_where_it_stopped() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let pd = suite.alloc_pd(&ctx)?;
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp = suite.create_qp(&pd, &cq)?;
    suite.set_up_self_connected_rc_qp(&mut qp, &local)?;

    // RTS -> INIT is not a legal transition, the recipe must fail on its first step
    let qpn = qp.qp_number();
    let err = suite.set_up_rc_qp(&mut qp, &local, local.gid, qpn).unwrap_err();
    assert_ne!(err.status(), 0);
    assert_eq!(qp.state(), QueuePairState::ReadyToSend);

    let (attr, _) = qp.query(QueuePairAttributeMask::State)?;
    assert_eq!(attr.state(), QueuePairState::ReadyToSend);

    Ok(())
}

#[test]
fn custom_rts_attributes_reach_the_device() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let pd = suite.alloc_pd(&ctx)?;
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp = suite.create_qp(&pd, &cq)?;
    let qpn = qp.qp_number();
    suite.set_qp_init(&mut qp, local.port)?;
    suite.set_qp_rtr(&mut qp, &local, local.gid, qpn)?;

    // an RC RTR -> RTS transition without its required attributes is rejected
    let err = suite
        .set_qp_rts_with(&mut qp, QueuePairAttribute::new(), QueuePairAttributeMask::none())
        .unwrap_err();
    if let ModifyQueuePairErrorKind::InvalidAttributeMask { needed, .. } = &err.0 {
        assert!(needed.contains(QueuePairAttributeMask::SendQueuePacketSequenceNumber));
    }
    assert_eq!(qp.state(), QueuePairState::ReadyToReceive);

    let mut attr = QueuePairAttribute::new();
    attr.setup_sq_psn(42)
        .setup_timeout(14)
        .setup_retry_cnt(7)
        .setup_rnr_retry(7)
        .setup_max_read_atomic(1);
    let mask = attr.attr_mask();
    suite.set_qp_rts_with(&mut qp, attr, mask)?;
    assert_eq!(qp.state(), QueuePairState::ReadyToSend);

    let (attr, _) = qp.query(QueuePairAttributeMask::SendQueuePacketSequenceNumber | QueuePairAttributeMask::RetryCount)?;
    assert_eq!(attr.sq_psn(), 42);
    assert_eq!(attr.retry_cnt(), 7);

    Ok(())
}

#[test]
fn rdma_read_pulls_the_peer_buffer() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    let mut remote = suite.alloc_buffer(1, false)?;
    let local_buf = suite.alloc_buffer(1, false)?;
    remote.as_mut_slice()[..MESSAGE.len()].copy_from_slice(MESSAGE);

    let pd = suite.alloc_pd(&ctx)?;
    let remote_mr = suite.reg_mr(&pd, &remote, AccessFlags::LocalWrite | AccessFlags::RemoteRead)?;
    let local_mr = suite.reg_mr(&pd, &local_buf, AccessFlags::LocalWrite)?;
    assert_eq!(remote_mr.get_ptr() as u64, remote.addr());
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp1 = suite.create_qp(&pd, &cq)?;
    let mut qp2 = suite.create_qp(&pd, &cq)?;
    suite.set_up_loopback_rc_qps(&mut qp1, &mut qp2, &local)?;

    let mut guard = qp1.start_post_send();
    unsafe {
        guard
            .construct_wr(3, WorkRequestFlags::Signaled)
            .setup_read(remote_mr.rkey(), remote.addr())
            .setup_sge(local_mr.lkey(), local_buf.addr(), MESSAGE.len() as u32)
    };
    guard.post()?;

    let wc = cq.wait_for_completion(TIMEOUT)?;
    assert!(wc.is_success(), "{wc:?}");
    assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::Read));
    assert_eq!(&local_buf.as_slice()[..MESSAGE.len()], MESSAGE);

    Ok(())
}

#[test]
fn write_with_immediate_consumes_a_receive() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };
    const IMM: u32 = 0xc0ff_ee00;

    let mut src = suite.alloc_buffer(1, false)?;
    let dst = suite.alloc_buffer(1, false)?;
    src.as_mut_slice()[..MESSAGE.len()].copy_from_slice(MESSAGE);

    let pd = suite.alloc_pd(&ctx)?;
    let src_mr = suite.reg_mr(&pd, &src, AccessFlags::LocalWrite)?;
    let dst_mr = suite.reg_mr(&pd, &dst, AccessFlags::LocalWrite | AccessFlags::RemoteWrite)?;
    let send_cq = suite.create_default_cq(&ctx)?;
    let recv_cq = suite.create_default_cq(&ctx)?;
    let mut qp1 = suite.create_qp(&pd, &send_cq)?;
    let mut qp2 = suite.create_qp(&pd, &recv_cq)?;
    suite.set_up_loopback_rc_qps(&mut qp1, &mut qp2, &local)?;

    let mut guard = qp2.start_post_recv();
    guard.construct_wr(31);
    guard.post()?;

    let mut guard = qp1.start_post_send();
    unsafe {
        guard
            .construct_wr(30, WorkRequestFlags::Signaled)
            .setup_write_imm(dst_mr.rkey(), dst.addr(), IMM)
            .setup_sge(src_mr.lkey(), src.addr(), MESSAGE.len() as u32)
    };
    guard.post()?;

    let wc = send_cq.wait_for_completion(TIMEOUT)?;
    assert!(wc.is_success(), "{wc:?}");
    assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::Write));

    let wc = recv_cq.wait_for_completion(TIMEOUT)?;
    assert!(wc.is_success(), "{wc:?}");
    assert_eq!(wc.wr_id(), 31);
    assert_eq!(wc.opcode(), Some(WorkCompletionOperationType::ReceiveWithImmediate));
    assert_eq!(wc.imm_data(), Some(IMM));
    assert_eq!(&dst.as_slice()[..MESSAGE.len()], MESSAGE);

    Ok(())
}

#[test]
fn inline_send_needs_no_registered_source() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };
    assert!(MESSAGE.len() as u32 <= suite.config().queue.max_inline_data);

    let recv_buf = suite.alloc_buffer(1, false)?;
    let pd = suite.alloc_pd(&ctx)?;
    let recv_mr = suite.reg_mr(&pd, &recv_buf, AccessFlags::LocalWrite)?;
    let cq = suite.create_default_cq(&ctx)?;
    let mut qp1 = suite.create_qp(&pd, &cq)?;
    let mut qp2 = suite.create_qp(&pd, &cq)?;
    suite.set_up_loopback_rc_qps(&mut qp1, &mut qp2, &local)?;

    let mut guard = qp2.start_post_recv();
    unsafe { guard.construct_wr(41).setup_sge(recv_mr.lkey(), recv_buf.addr(), MESSAGE.len() as u32) };
    guard.post()?;

    // inline data is copied when posting, the payload can go right after
    {
        let payload = MESSAGE.to_vec();
        let mut guard = qp1.start_post_send();
        guard
            .construct_wr(40, WorkRequestFlags::Signaled)
            .setup_send()
            .setup_inline_data(&payload);
        guard.post()?;
    }

    let mut received = false;
    for _ in 0..2 {
        let wc = cq.wait_for_completion(TIMEOUT)?;
        assert!(wc.is_success(), "{wc:?}");
        if wc.wr_id() == 41 {
            assert_eq!(wc.byte_len(), MESSAGE.len() as u32);
            received = true;
        }
    }
    assert!(received);
    assert_eq!(&recv_buf.as_slice()[..MESSAGE.len()], MESSAGE);

    Ok(())
}
