use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pulsewire_sdk::{cancel_pair, PositionEvent, Relay, RelayConfig, SenderId, SubscribeOptions};

/// Publish cost as the number of subscribers on the topic grows
fn bench_publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");

    for subscribers in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            subscribers,
            |b, &subscribers| {
                let relay = Relay::new(RelayConfig {
                    subscriber_buffer: 1,
                    ..Default::default()
                });
                let (_close, signal) = cancel_pair();
                let mut subs: Vec<_> = (0..subscribers)
                    .map(|i| {
                        relay.subscribe(
                            "bench",
                            SubscribeOptions::default().origin(SenderId::new(format!("s{i}"))),
                            signal.clone(),
                        )
                    })
                    .collect();

                b.iter(|| {
                    relay.publish("bench", black_box(PositionEvent::new("pub", 1.0, 2.0)));
                    for sub in subs.iter_mut() {
                        black_box(sub.try_recv());
                    }
                });
            },
        );
    }
    group.finish();
}

/// Resume replay cost against a full buffer
fn bench_resume_replay(c: &mut Criterion) {
    let relay = Relay::default();
    for i in 0..4096 {
        relay.publish("bench", PositionEvent::new("pub", i as f64, 0.0));
    }
    let (_close, signal) = cancel_pair();

    c.bench_function("resume_replay_half_buffer", |b| {
        b.iter(|| {
            let sub = relay.subscribe(
                "bench",
                SubscribeOptions::default().resume_after(black_box(2048)),
                signal.clone(),
            );
            black_box(sub.pending_replay())
        });
    });
}

criterion_group!(benches, bench_publish_fanout, bench_resume_replay);
criterion_main!(benches);
