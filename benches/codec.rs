use apelios_core::signaling::{Role, Routing, SessionDescription, SignalingMessage};
use apelios_core::media::FrameQueue;
use criterion::{criterion_group, criterion_main, Criterion};

fn sample_offer() -> SignalingMessage {
    let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".repeat(40);
    SignalingMessage::description(Role::Sender, SessionDescription::offer(sdp)).with_routing(
        Routing {
            session_id: Some(17),
            peer_id: Some(3),
        },
    )
}

fn bench_signaling_codec(c: &mut Criterion) {
    let message = sample_offer();
    let text = message.encode().expect("encode offer");

    c.bench_function("encode_offer", |b| {
        b.iter(|| {
            let _ = message.encode().expect("encode offer");
        })
    });

    c.bench_function("decode_offer", |b| {
        b.iter(|| {
            let _ = SignalingMessage::decode(&text).expect("decode offer");
        })
    });
}

fn bench_frame_queue(c: &mut Criterion) {
    let queue = FrameQueue::new(2);

    c.bench_function("frame_queue_push_pop", |b| {
        b.iter(|| {
            queue.push(1u64);
            queue.push(2u64);
            queue.push(3u64);
            while queue.try_pop().is_some() {}
        })
    });
}

criterion_group!(benches, bench_signaling_codec, bench_frame_queue);
criterion_main!(benches);
