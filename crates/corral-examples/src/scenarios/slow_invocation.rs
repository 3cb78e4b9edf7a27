use std::sync::Arc;
use std::time::Duration;

use corral::{
    Config, EchoConfig, EchoModerator, SlowDetector, SlowPolicy, SyncSnapshot,
};

use super::tracked_registry;

/// A render call stalls while a moderated pool runs slow queries.
pub fn run() -> Result<SyncSnapshot, String> {
    let (registry, factory) = tracked_registry();
    let config = Config::from_env();

    let detector = Arc::new(SlowDetector::new(
        SlowPolicy::Own,
        None,
        Some(config.slow_threshold.min(Duration::from_millis(50))),
        Some(config.slow_period.min(Duration::from_millis(20))),
        Arc::clone(&factory),
    ));
    registry.register("demo.render", &detector);

    let mut db_config = EchoConfig::new("demo.db", 2);
    db_config.latency_threshold = Duration::from_millis(20);
    db_config.waiting_threshold = 1;
    db_config.period = Duration::from_millis(10);
    let db = Arc::new(EchoModerator::new(db_config, factory, None));
    registry.register("demo.db", &db);

    let render = detector.start("render /dashboard");
    render.interval("layout");

    let snapshot = std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| db.run(|| std::thread::sleep(Duration::from_millis(60))));
        }
        std::thread::sleep(Duration::from_millis(100));
        render.interval("queries issued");
        registry.snapshot()
    });

    let took = render.stop();
    tracing::info!(
        took_secs = took.as_secs_f64(),
        max_latency_secs = db.timer().max_latency().as_secs_f64(),
        "render finished"
    );
    detector.shutdown();
    Ok(snapshot)
}
