use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use resnotify::channel::ChannelRegistry;
use resnotify::delivery::{CallbackSender, DeliveryHandler, DeliveryRouter, Senders};
use resnotify::matching::{MatchingCounters, MatchingEngine};
use resnotify::subscription::CriteriaError;
use resnotify::{
    ActiveSubscription, ChannelSettings, ChannelType, Criteria, DeliveryError, Endpoint, MessageHandler,
    PipelineConfig, ResourceModifiedMessage, ResourceOperation, RetryPolicy, SubscriptionId,
    SubscriptionPipeline, SubscriptionRegistry,
};

struct NullSender;

impl CallbackSender for NullSender {
    fn send_callback(&self, _: &str, _: &[(String, String)], _: Option<&str>) -> Result<(), DeliveryError> {
        Ok(())
    }
}

fn gender_subscription(i: usize) -> ActiveSubscription {
    let wanted = if i % 2 == 0 { "female" } else { "male" };
    let criteria = Criteria::parse_with(
        &format!("Patient?gender={wanted}"),
        Arc::new(move |m: &ResourceModifiedMessage| -> Result<bool, CriteriaError> {
            Ok(m.snapshot().and_then(|s| s.get("gender")).and_then(|g| g.as_str()) == Some(wanted))
        }),
    )
    .unwrap();
    ActiveSubscription::new(
        SubscriptionId::new(format!("sub-{i}")).unwrap(),
        criteria,
        Endpoint::rest_hook(format!("http://localhost/hook/{i}")),
    )
    .unwrap()
}

fn change(i: u64) -> ResourceModifiedMessage {
    let id = format!("p{i}");
    ResourceModifiedMessage::builder("Patient", id.as_str(), ResourceOperation::Update)
        .snapshot(json!({ "resourceType": "Patient", "id": id, "gender": "other" }))
        .build()
        .unwrap()
}

fn bench_engine_no_match(c: &mut Criterion) {
    // 256 subscriptions whose predicates all run and all reject.
    let channels = Arc::new(ChannelRegistry::default());
    let subscriptions = Arc::new(SubscriptionRegistry::new([ChannelType::RestHook]));
    for i in 0..256 {
        subscriptions.put(gender_subscription(i)).unwrap();
    }
    let router = Arc::new(DeliveryRouter::new(
        Arc::clone(&channels),
        Arc::clone(&subscriptions),
        Vec::<DeliveryHandler>::new(),
        ChannelSettings::default(),
    ));
    let engine = MatchingEngine::new(
        ChannelType::RestHook,
        subscriptions,
        router,
        Arc::new(MatchingCounters::default()),
    );
    let message = change(0);

    c.bench_function("matching/engine_256_subscriptions_no_match", |b| {
        b.iter(|| engine.handle(&message).unwrap());
    });
}

fn bench_pipeline_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching/pipeline");
    group.throughput(Throughput::Elements(1));
    group.bench_function("submit_to_delivery_16_matches", |b| {
        b.iter_custom(|iters| {
            // Fresh pipeline per sample; setup is excluded from timing.
            let mut config = PipelineConfig::default().with_supported([ChannelType::RestHook]);
            config.retry = RetryPolicy::none();
            config.outcome_feed_capacity = 0;
            config.matching.default = ChannelSettings::new(2, 1024);
            let pipeline =
                SubscriptionPipeline::new(config, Senders::new().with_callback(Arc::new(NullSender))).unwrap();
            pipeline.register_interceptors([ChannelType::RestHook]).unwrap();
            for i in 0..16 {
                pipeline
                    .upsert_subscription(
                        ActiveSubscription::new(
                            SubscriptionId::new(format!("all-{i}")).unwrap(),
                            Criteria::parse("Patient").unwrap(),
                            Endpoint::rest_hook(format!("http://localhost/all/{i}")),
                        )
                        .unwrap(),
                    )
                    .unwrap();
            }

            let start = Instant::now();
            for i in 0..iters {
                pipeline.submit(change(i)).unwrap();
            }
            assert!(pipeline.wait_for_idle(Duration::from_secs(60)).unwrap());
            start.elapsed()
        });
    });
    group.finish();
}

criterion_group!(matching, bench_engine_no_match, bench_pipeline_throughput);
criterion_main!(matching);
