mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use common::{Node, callback, connect, drive_until, pair, pattern, test_config};
use parcelport_lib::{
    Chunk, MockParcelDecoder, ParcelChunk, ParcelportError,
    api::MemoryRegionRemoteKey,
    header::{ChunkDescriptor, ChunkKind, HEADER_FIXED_LEN, HeaderSpec, RdmaTarget, encode},
    loopback::{LoopbackConfig, LoopbackFabric},
    provider::{CompletionContext, FabricDomain, FabricEndpoint, MrAccess},
};

#[test]
fn test_piggybacked_message_completes_on_send() {
    let (_fabric, a, b) = pair(test_config());
    let before = a.port.memory_pool().outstanding();
    let payload = pattern(100, 1);

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let buffer = a.port.send_buffer(&payload).unwrap();
    a.port.async_write(conn, buffer, cb).unwrap();

    // The local send completion alone finishes the message.
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert!(cb_rx.try_recv().is_err());
    assert_eq!(a.port.senders_in_use(), 0);
    assert_eq!(a.port.memory_pool().outstanding(), before);

    b.port.background_work();
    let (_, parcel) = b.rx.try_recv().unwrap();
    assert!(!parcel.is_rma());
    assert_eq!(parcel.data(), &payload[..]);
    assert_eq!(b.port.posted_receives(), 3);
    drop(parcel);
    assert_eq!(b.port.posted_receives(), 4);

    b.port.background_work();
    let stats = b.port.stats();
    assert_eq!(stats.messages_handled, 1);
    assert_eq!(stats.msg_plain, 1);
    assert_eq!(stats.msg_rma, 0);
    assert_eq!(stats.rma_reads, 0);
    assert_eq!(stats.sent_ack, 0);
    assert_eq!(stats.recv_deletes, 1);
    assert_eq!(a.port.stats().acks_received, 0);
}

#[test]
fn test_inline_and_index_chunks_need_no_rma() {
    let (_fabric, a, b) = pair(test_config());
    let payload = pattern(200, 2);
    let tiny = Bytes::from_static(b"tiny chunk");

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let buffer = a
        .port
        .send_buffer(&payload)
        .unwrap()
        .with_chunk(Chunk::Index { offset: 10, len: 50 })
        .with_chunk(Chunk::Pointer(tiny.clone()));
    a.port.async_write(conn, buffer, cb).unwrap();
    assert!(cb_rx.try_recv().unwrap().is_ok());

    b.port.background_work();
    let (_, parcel) = b.rx.try_recv().unwrap();
    assert_eq!(parcel.num_chunks(), (0, 2));
    let chunks: Vec<_> = parcel.chunks().collect();
    assert_eq!(chunks[0], ParcelChunk::Index { offset: 10, data: &payload[10..60] });
    assert_eq!(chunks[1], ParcelChunk::Inline(&tiny[..]));
    drop(chunks);
    parcel.release().unwrap();

    b.port.background_work();
    assert_eq!(b.port.stats().rma_reads, 0);
    assert_eq!(b.port.stats().sent_ack, 0);
}

#[test]
fn test_zero_copy_chunks_and_payload_are_read() {
    let (_fabric, a, b) = pair(test_config());
    let a_before = a.port.memory_pool().outstanding();
    let b_before = b.port.memory_pool().outstanding();
    let payload = pattern(4000, 3);
    let chunks: Vec<Bytes> = (0..3).map(|i| Bytes::from(pattern(10_000, 10 + i))).collect();

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let mut buffer = a.port.send_buffer(&payload).unwrap();
    for chunk in &chunks {
        buffer = buffer.with_chunk(Chunk::Pointer(chunk.clone()));
    }
    a.port.async_write(conn, buffer, cb).unwrap();

    // Send completion seen, the ack is still outstanding.
    assert!(cb_rx.try_recv().is_err());
    assert_eq!(a.port.senders_in_use(), 1);

    drive_until(&[&b], || !b.rx.is_empty());
    let (_, parcel) = b.rx.try_recv().unwrap();
    assert!(parcel.is_rma());
    assert_eq!(parcel.num_chunks(), (3, 0));
    assert_eq!(parcel.data(), &payload[..]);
    for ((chunk, desc), original) in parcel.chunks().zip(parcel.descriptors()).zip(&chunks) {
        let ParcelChunk::ZeroCopy(data) = chunk else {
            panic!("expected zero-copy chunk, got {:?}", chunk);
        };
        assert_eq!(data, &original[..]);
        assert_eq!(desc.kind, ChunkKind::Pointer);
        assert_eq!(desc.addr, data.as_ptr() as u64);
        assert_ne!(desc.addr, original.as_ptr() as u64);
    }
    assert_eq!(b.port.stats().rma_reads, 4);
    assert_eq!(b.port.stats().msg_rma, 1);

    a.port.background_work();
    assert!(cb_rx.try_recv().is_err(), "callback must wait for the ack");

    drop(parcel);
    drive_until(&[&a, &b], || a.port.senders_in_use() == 0);
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert!(cb_rx.try_recv().is_err());
    b.port.background_work();

    assert_eq!(a.port.stats().acks_received, 1);
    assert_eq!(b.port.stats().sent_ack, 1);
    assert_eq!(b.port.stats().recv_deletes, 1);
    assert_eq!(a.port.memory_pool().outstanding(), a_before);
    assert_eq!(b.port.memory_pool().outstanding(), b_before);
    assert_eq!(b.port.posted_receives(), 4);
}

#[test]
fn test_small_chunk_is_copied_into_a_pool_region() {
    let (_fabric, a, b) = pair(test_config());
    let chunk = Bytes::from(pattern(200, 4));

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let buffer = a.port.send_buffer(b"small").unwrap().with_chunk(Chunk::Pointer(chunk.clone()));
    a.port.async_write(conn, buffer, cb).unwrap();

    drive_until(&[&b], || !b.rx.is_empty());
    let (_, parcel) = b.rx.try_recv().unwrap();
    // Payload piggybacked, only the chunk is read.
    assert_eq!(b.port.stats().rma_reads, 1);
    assert_eq!(parcel.data(), b"small");
    assert_eq!(parcel.chunks().next().map(|c| c.data()), Some(&chunk[..]));
    drop(parcel);

    drive_until(&[&a, &b], || a.port.senders_in_use() == 0);
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert_eq!(a.port.memory_pool().ad_hoc_outstanding(), 0);
}

#[test]
fn test_ack_is_not_decoded() {
    logging_lib::init_for_tests();
    let fabric = LoopbackFabric::new();
    let mut decoder = MockParcelDecoder::new();
    decoder.expect_decode().never();
    let (_tx, rx) = crossbeam_channel::unbounded();
    let a = Node::start_with_decoder(
        &fabric,
        test_config(),
        LoopbackConfig::default(),
        Arc::new(decoder),
        rx,
    );
    let b = Node::start(&fabric, test_config());
    connect(&a, &b);

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let buffer = a.port.send_buffer(&pattern(2000, 5)).unwrap();
    a.port.async_write(conn, buffer, cb).unwrap();

    drive_until(&[&b], || !b.rx.is_empty());
    drop(b.rx.try_recv().unwrap());

    drive_until(&[&a, &b], || a.port.senders_in_use() == 0);
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert!(cb_rx.try_recv().is_err());
    assert_eq!(a.port.stats().acks_received, 1);
    assert_eq!(a.port.stats().messages_handled, 1);
    assert_eq!(a.port.posted_receives(), 4);
}

#[test]
fn test_stale_ack_is_dropped() {
    let (_fabric, a, b) = pair(test_config());

    // Tag of a sender generation that was never handed out.
    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let stale_tag = conn.tag() + (7 << 32);
    drop(conn);
    let a_addr = b.port.insert_address(&a.port.here()).unwrap();
    b.endpoint
        .inject(&stale_tag.to_le_bytes(), a_addr, CompletionContext::Ack(stale_tag))
        .unwrap();

    a.port.background_work();
    b.port.background_work();
    assert_eq!(a.port.stats().acks_received, 1);
    assert_eq!(a.port.senders_in_use(), 0);
    assert_eq!(a.port.posted_receives(), 4);
    assert_eq!(b.port.stats().sent_ack, 1);
}

#[test]
fn test_get_connection_backpressure() {
    let (_fabric, a, b) = pair(test_config().with_num_senders(2));
    let first = a.port.get_connection(&b.port.here()).unwrap();
    let second = a.port.get_connection(&b.port.here()).unwrap();
    assert!(first.is_some() && second.is_some());
    assert!(a.port.get_connection(&b.port.here()).unwrap().is_none());

    drop(first);
    assert!(a.port.get_connection(&b.port.here()).unwrap().is_some());
}

#[test]
fn test_unknown_locality() {
    let (fabric, a, _b) = pair(test_config());
    let stranger = fabric.open_endpoint(LoopbackConfig::default());
    match a.port.get_connection(&stranger.locality()) {
        Err(ParcelportError::UnknownLocality(locality)) => {
            assert_eq!(locality, stranger.locality())
        }
        other => panic!("unexpected {:?}", other.map(|c| c.is_some())),
    }
}

#[test]
fn test_eagain_is_retried() {
    let (_fabric, a, b) = pair(test_config());
    a.endpoint.inject_again(5);

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let buffer = a.port.send_buffer(&pattern(64, 6)).unwrap();
    a.port.async_write(conn, buffer, cb).unwrap();
    assert!(cb_rx.try_recv().unwrap().is_ok());

    b.port.background_work();
    let (_, parcel) = b.rx.try_recv().unwrap();
    assert_eq!(parcel.data(), &pattern(64, 6)[..]);
}

#[test]
fn test_tx_depth_is_drained_while_posting() {
    logging_lib::init_for_tests();
    let fabric = LoopbackFabric::new();
    let a = Node::start_with(&fabric, test_config(), LoopbackConfig::default().with_tx_depth(1));
    let b = Node::start(&fabric, test_config());
    connect(&a, &b);

    let (cb, cb_rx) = callback();
    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    a.port.async_write(conn, a.port.send_buffer(b"one").unwrap(), cb).unwrap();
    let (cb2, cb2_rx) = callback();
    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    a.port.async_write(conn, a.port.send_buffer(b"two").unwrap(), cb2).unwrap();
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert!(cb2_rx.try_recv().unwrap().is_ok());
}

#[test]
fn test_header_overflow_fails_the_write() {
    let (_fabric, a, b) = pair(test_config());
    let before = a.port.memory_pool().outstanding();
    let max_chunks = (1024 - HEADER_FIXED_LEN) / 32;

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let mut buffer = a.port.send_buffer(&[0u8; 8]).unwrap();
    for _ in 0..=max_chunks {
        buffer = buffer.with_chunk(Chunk::Index { offset: 0, len: 1 });
    }
    let result = a.port.async_write(conn, buffer, cb);
    assert!(matches!(result, Err(ParcelportError::HeaderOverflow { .. })));
    assert!(matches!(cb_rx.try_recv().unwrap(), Err(ParcelportError::HeaderOverflow { .. })));
    assert_eq!(a.port.senders_in_use(), 0);
    assert_eq!(a.port.memory_pool().outstanding(), before);
}

#[test]
fn test_failed_read_drops_the_message() {
    let (fabric, _a, b) = pair(test_config());
    let b_before = b.port.memory_pool().outstanding();
    let raw = fabric.open_endpoint(LoopbackConfig::default());
    let dest = raw.insert_address(&b.port.here()).unwrap();
    b.port.insert_address(&raw.locality()).unwrap();

    let payload = vec![0u8; 4000];
    let mut header = vec![0u8; 1024];
    let encoded = encode(
        &mut header,
        &HeaderSpec {
            tag: 42,
            payload: &payload,
            payload_target: RdmaTarget {
                addr: payload.as_ptr() as u64,
                rkey: MemoryRegionRemoteKey(0xdead),
                len: payload.len() as u64,
            },
            chunks: &[],
            inline_data: &[],
        },
    )
    .unwrap();
    assert!(!encoded.piggyback);
    raw.inject(&header[..encoded.header_length], dest, CompletionContext::Ack(42)).unwrap();

    drive_until(&[&b], || {
        b.port.stats().msg_rma == 1 && b.port.memory_pool().outstanding() == b_before
    });
    b.port.background_work();
    assert!(b.rx.try_recv().is_err());
    assert_eq!(b.port.stats().sent_ack, 0);
    assert_eq!(b.port.posted_receives(), 4);
}

#[test]
fn test_oversized_piggyback_header_is_dropped() {
    let (fabric, _a, b) = pair(test_config());
    let raw = fabric.open_endpoint(LoopbackConfig::default());
    let dest = raw.insert_address(&b.port.here()).unwrap();
    b.port.insert_address(&raw.locality()).unwrap();

    let payload = pattern(64, 11);
    let mut header = vec![0u8; 1024];
    let encoded = encode(
        &mut header,
        &HeaderSpec {
            tag: 7,
            payload: &payload,
            payload_target: RdmaTarget { addr: 0, rkey: MemoryRegionRemoteKey(0), len: 0 },
            chunks: &[],
            inline_data: &[],
        },
    )
    .unwrap();
    assert!(encoded.piggyback);
    for size in [u64::MAX, u64::MAX - 32, 4096] {
        header[..8].copy_from_slice(&size.to_le_bytes());
        let len = encoded.header_length + payload.len();
        raw.inject(&header[..len], dest, CompletionContext::Ack(7)).unwrap();
        b.port.background_work();
    }

    assert!(b.rx.try_recv().is_err());
    assert_eq!(b.port.stats().messages_handled, 3);
    assert_eq!(b.port.stats().msg_plain, 0);
    assert_eq!(b.port.posted_receives(), 4);
}

#[test]
fn test_rdma_length_mismatch_is_dropped() {
    let (fabric, _a, b) = pair(test_config());
    let raw = fabric.open_endpoint(LoopbackConfig::default());
    let dest = raw.insert_address(&b.port.here()).unwrap();
    b.port.insert_address(&raw.locality()).unwrap();

    // Only 16 bytes are exposed while the header claims 4000.
    let mut exposed = vec![5u8; 16];
    let ptr = std::ptr::NonNull::new(exposed.as_mut_ptr()).unwrap();
    let reg = raw.loopback_domain().register(ptr, exposed.len(), MrAccess::ReadWrite).unwrap();
    let payload = vec![0u8; 4000];
    let chunks = [ChunkDescriptor::index(100, 50)];
    let mut header = vec![0u8; 1024];
    let encoded = encode(
        &mut header,
        &HeaderSpec {
            tag: 9,
            payload: &payload,
            payload_target: RdmaTarget { addr: ptr.as_ptr() as u64, rkey: reg.rkey, len: 16 },
            chunks: &chunks,
            inline_data: &[],
        },
    )
    .unwrap();
    assert!(!encoded.piggyback);
    raw.inject(&header[..encoded.header_length], dest, CompletionContext::Ack(9)).unwrap();

    b.port.background_work();
    b.port.background_work();
    assert!(b.rx.try_recv().is_err());
    assert_eq!(b.port.stats().msg_rma, 0);
    assert_eq!(b.port.stats().rma_reads, 0);
    assert_eq!(b.port.posted_receives(), 4);
}

#[test]
fn test_failed_slot_allocation_keeps_the_receive_slot() {
    logging_lib::init_for_tests();
    let fabric = LoopbackFabric::new();
    let a = Node::start(&fabric, test_config().with_stop_timeout_ms(20));
    // The receives take every preallocated header region.
    let b = Node::start(
        &fabric,
        test_config().with_size_classes(vec![1024, 16 << 10], vec![4, 2]).with_stop_timeout_ms(20),
    );
    connect(&a, &b);
    b.endpoint.loopback_domain().fail_registrations(1);

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (lost_cb, lost_rx) = callback();
    a.port.async_write(conn, a.port.send_buffer(&pattern(3000, 12)).unwrap(), lost_cb).unwrap();
    b.port.background_work();
    assert!(b.rx.try_recv().is_err());
    assert_eq!(b.port.stats().messages_handled, 1);
    assert_eq!(b.port.stats().msg_rma, 0);
    assert_eq!(b.port.posted_receives(), 4);
    assert_eq!(b.endpoint.posted_receives(), 4);

    // The slot still receives once registrations succeed again.
    let payload = pattern(3000, 13);
    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    a.port.async_write(conn, a.port.send_buffer(&payload).unwrap(), cb).unwrap();
    drive_until(&[&b], || !b.rx.is_empty());
    let (_, parcel) = b.rx.try_recv().unwrap();
    assert_eq!(parcel.data(), &payload[..]);
    drop(parcel);
    drive_until(&[&a, &b], || a.port.senders_in_use() == 1);
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert_eq!(b.port.posted_receives(), 4);

    assert!(lost_rx.try_recv().is_err());
    a.port.stop();
    assert!(matches!(lost_rx.try_recv().unwrap(), Err(ParcelportError::Stopped)));
}

#[test]
fn test_ack_before_local_send_completion() {
    let (_fabric, a, b) = pair(test_config());
    let before = a.port.memory_pool().outstanding();
    a.endpoint.hold_tx_completions();

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    a.port.async_write(conn, a.port.send_buffer(&pattern(3000, 14)).unwrap(), cb).unwrap();
    assert_eq!(a.endpoint.held_tx_completions(), 1);

    drive_until(&[&b], || !b.rx.is_empty());
    drop(b.rx.try_recv().unwrap());
    drive_until(&[&a, &b], || a.port.stats().acks_received == 1);

    // The ack alone runs the callback, the sender waits for its send.
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert_eq!(a.port.senders_in_use(), 1);
    assert_ne!(a.port.memory_pool().outstanding(), before);

    a.endpoint.release_tx_completions();
    a.port.background_work();
    assert_eq!(a.port.senders_in_use(), 0);
    assert_eq!(a.port.memory_pool().outstanding(), before);
    assert!(cb_rx.try_recv().is_err());
}

#[test]
fn test_reads_completing_out_of_order() {
    let (_fabric, a, b) = pair(test_config());
    let payload = pattern(4000, 15);
    let chunks: Vec<Bytes> = (0..3).map(|i| Bytes::from(pattern(10_000, 20 + i))).collect();
    b.endpoint.hold_tx_completions();

    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    let mut buffer = a.port.send_buffer(&payload).unwrap();
    for chunk in &chunks {
        buffer = buffer.with_chunk(Chunk::Pointer(chunk.clone()));
    }
    a.port.async_write(conn, buffer, cb).unwrap();

    b.port.background_work();
    assert_eq!(b.port.stats().rma_reads, 4);
    assert_eq!(b.endpoint.held_tx_completions(), 4);

    // Newest first, the parcel waits for the last outstanding read.
    for n in [1, 2] {
        b.endpoint.release_newest_tx_completions(n);
        b.port.background_work();
        assert!(b.rx.try_recv().is_err());
    }
    assert_eq!(b.endpoint.held_tx_completions(), 1);
    b.endpoint.release_tx_completions();
    b.port.background_work();

    let (_, parcel) = b.rx.try_recv().unwrap();
    assert_eq!(parcel.data(), &payload[..]);
    for (chunk, original) in parcel.chunks().zip(&chunks) {
        assert_eq!(chunk.data(), &original[..]);
    }
    assert!(b.rx.try_recv().is_err());
    drop(parcel);

    drive_until(&[&a, &b], || a.port.senders_in_use() == 0);
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert!(cb_rx.try_recv().is_err());
}

#[test]
fn test_truncated_receive_is_reposted() {
    let (fabric, _a, b) = pair(test_config());
    let raw = fabric.open_endpoint(LoopbackConfig::default());
    let dest = raw.insert_address(&b.port.here()).unwrap();

    raw.inject(&[7u8; 2048], dest, CompletionContext::Ack(0)).unwrap();
    b.port.background_work();
    assert!(b.rx.try_recv().is_err());
    assert_eq!(b.port.posted_receives(), 4);
    assert_eq!(b.endpoint.posted_receives(), 4);
}

#[test]
fn test_stop_refuses_new_connections() {
    let (_fabric, a, b) = pair(test_config());
    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    a.port.async_write(conn, a.port.send_buffer(&pattern(3000, 7)).unwrap(), cb).unwrap();
    drive_until(&[&b], || !b.rx.is_empty());
    drop(b.rx.try_recv().unwrap());
    b.port.background_work();

    a.port.stop();
    assert!(a.port.is_stopped());
    assert!(cb_rx.try_recv().unwrap().is_ok());
    assert_eq!(a.port.senders_in_use(), 0);
    assert!(a.port.get_connection(&b.port.here()).unwrap().is_none());
    a.port.stop();
}

#[test]
fn test_stop_abandons_unacked_messages() {
    let (_fabric, a, b) = pair(test_config().with_stop_timeout_ms(20));
    let before = a.port.memory_pool().outstanding();
    let conn = a.port.get_connection(&b.port.here()).unwrap().unwrap();
    let (cb, cb_rx) = callback();
    a.port.async_write(conn, a.port.send_buffer(&pattern(3000, 9)).unwrap(), cb).unwrap();
    drive_until(&[&b], || !b.rx.is_empty());
    let (_, parcel) = b.rx.try_recv().unwrap();

    // The receiver holds the parcel, so the ack never arrives in time.
    a.port.stop();
    assert!(matches!(cb_rx.try_recv().unwrap(), Err(ParcelportError::Stopped)));
    assert!(cb_rx.try_recv().is_err());
    assert_eq!(a.port.senders_in_use(), 0);
    assert_eq!(a.port.memory_pool().outstanding(), before);

    drop(parcel);
    b.port.background_work();
    a.port.background_work();
    assert!(cb_rx.try_recv().is_err());
}

#[test]
fn test_polling_threads_deliver_concurrently() {
    logging_lib::init_for_tests();
    let fabric = LoopbackFabric::new();
    let config = test_config().with_num_senders(8).with_polling_threads(2);
    let a = Node::start(&fabric, config.clone());
    let b = Node::start(&fabric, config);
    connect(&a, &b);
    let a_before = a.port.memory_pool().outstanding();

    const MESSAGES: usize = 64;
    let fired: Arc<Vec<AtomicUsize>> = Arc::new((0..MESSAGES).map(|_| AtomicUsize::new(0)).collect());
    let chunk = Bytes::from(pattern(5000, 8));
    let mut received = 0;
    let check = |parcel: parcelport_lib::ParcelBuffer| {
        assert_eq!(parcel.chunks().next().map(|c| c.data()), Some(&chunk[..]));
    };
    for i in 0..MESSAGES {
        let conn = loop {
            if let Some(conn) = a.port.get_connection(&b.port.here()).unwrap() {
                break conn;
            }
            while let Ok((_, parcel)) = b.rx.try_recv() {
                check(parcel);
                received += 1;
            }
            std::thread::yield_now();
        };
        let fired = fired.clone();
        let buffer = a
            .port
            .send_buffer(&pattern(2000 + i, i as u8))
            .unwrap()
            .with_chunk(Chunk::Pointer(chunk.clone()));
        a.port
            .async_write(
                conn,
                buffer,
                Box::new(move |result| {
                    result.map_err(|e| e.to_string())?;
                    fired[i].fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
    }

    while received < MESSAGES {
        let (_, parcel) = b.rx.recv_timeout(Duration::from_secs(10)).unwrap();
        check(parcel);
        received += 1;
    }
    for _ in 0..10_000 {
        if a.port.senders_in_use() == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(a.port.senders_in_use(), 0);
    assert!(fired.iter().all(|n| n.load(Ordering::SeqCst) == 1));
    assert_eq!(a.port.memory_pool().outstanding(), a_before);
}
