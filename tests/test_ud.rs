mod common;

use std::error::Error;
use std::time::Duration;

use verbs_harness::harness::VerbsHelperSuite;
use verbs_harness::ibverbs::completion::{WorkCompletionFlags, WorkCompletionOperationType};
use verbs_harness::ibverbs::queue_pair::{QueuePairState, QueuePairType, SetScatterGatherEntry, WorkRequestFlags};
use verbs_harness::ibverbs::AccessFlags;

const GRH_LEN: usize = 40;
const QKEY: u32 = 0x1111_2222;

#[test]
fn datagram_reaches_the_peer_through_an_address_handle() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };
    let message = b"unreliable datagram";

    let mut buf = suite.alloc_buffer(1, false)?;
    buf.as_mut_slice()[..message.len()].copy_from_slice(message);
    let recv_offset = buf.len() / 2;

    let pd = suite.alloc_pd(&ctx)?;
    let mr = suite.reg_mr(&pd, &buf, AccessFlags::LocalWrite)?;
    let cq = suite.create_default_cq(&ctx)?;
    let max_wr = suite.config().queue.max_send_wr;
    let mut sender =
        suite.create_qp_full(&pd, &cq, &cq, None, max_wr, max_wr, QueuePairType::UnreliableDatagram, false)?;
    let mut receiver =
        suite.create_qp_full(&pd, &cq, &cq, None, max_wr, max_wr, QueuePairType::UnreliableDatagram, false)?;
    assert_eq!(sender.qp_type(), QueuePairType::UnreliableDatagram);

    suite.set_up_ud_qp(&mut sender, &local, QKEY)?;
    suite.set_up_ud_qp(&mut receiver, &local, QKEY)?;
    assert_eq!(sender.state(), QueuePairState::ReadyToSend);
    assert_eq!(receiver.state(), QueuePairState::ReadyToSend);

    let ah = suite.create_ah(&pd, local.gid)?;

    let mut guard = receiver.start_post_recv();
    unsafe {
        guard.construct_wr(2).setup_sge(
            mr.lkey(),
            buf.addr() + recv_offset as u64,
            (GRH_LEN + message.len()) as u32,
        )
    };
    guard.post()?;

    let mut guard = sender.start_post_send();
    unsafe {
        guard
            .construct_wr(1, WorkRequestFlags::Signaled)
            .setup_ud_addr(&ah, receiver.qp_number(), QKEY)
            .setup_send()
            .setup_sge(mr.lkey(), buf.addr(), message.len() as u32)
    };
    guard.post()?;

    let mut received = None;
    for _ in 0..2 {
        let wc = cq.wait_for_completion(Duration::from_secs(10))?;
        assert!(wc.is_success(), "{wc:?}");
        if wc.opcode() == Some(WorkCompletionOperationType::Receive) {
            received = Some(wc);
        }
    }

    let wc = received.ok_or("no receive completion")?;
    assert_eq!(wc.wr_id(), 2);
    assert_eq!(wc.src_qp(), sender.qp_number());
    assert!(wc.wc_flags().contains(WorkCompletionFlags::Grh));
    assert_eq!(wc.byte_len() as usize, GRH_LEN + message.len());

    let payload = &buf.as_slice()[recv_offset + GRH_LEN..recv_offset + GRH_LEN + message.len()];
    assert_eq!(payload, message);

    Ok(())
}

#[test]
fn address_handle_from_a_context_opened_elsewhere() -> Result<(), Box<dyn Error>> {
    let suite = VerbsHelperSuite::new();
    let Some((ctx, local)) = common::open_device(&suite) else {
        return Ok(());
    };

    // `other` never opened a device, it only learns the context through the PD
    let other = VerbsHelperSuite::new();
    let pd = other.alloc_pd(&ctx)?;
    let ah = other.create_ah(&pd, local.gid)?;
    assert_eq!(other.get_local_port_gid(&ctx)?, local);
    assert!(other.destroy_ah(ah).is_ok());
    assert!(other.dealloc_pd(pd).is_ok());

    let pd = suite.alloc_pd(&ctx)?;
    let ah = suite.create_ah(&pd, local.gid)?;
    assert!(suite.destroy_ah(ah).is_ok());

    Ok(())
}
