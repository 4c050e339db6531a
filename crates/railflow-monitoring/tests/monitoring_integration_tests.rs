use railflow_core::{
    Element, Engine, EngineConfig, EventPattern, FlowDefinition, FlowRegistry, Payload,
    RecordingBackend, RecordingObserver, RecordingTimers, SendTemplate,
};
use railflow_monitoring::{EngineStats, MetricsObserver};
use std::sync::Arc;

#[test]
fn test_metrics_observer_tracks_engine_activity() {
    // Arrange
    let flows = vec![
        FlowDefinition::new("quiet")
            .with_priority(1)
            .activated_by(EventPattern::new("greeting"))
            .then(Element::send(SendTemplate::new("bot_say").external())),
        FlowDefinition::new("loud")
            .with_priority(9)
            .activated_by(EventPattern::new("greeting"))
            .then(Element::send(SendTemplate::new("bot_say").external()))
            .then(Element::execute("log_turn")),
    ];
    let stats = Arc::new(EngineStats::new());
    let recorder = Arc::new(RecordingObserver::new());
    let observer = MetricsObserver::with_stats(stats.clone()).forwarding_to(recorder.clone());
    let mut engine = Engine::new(
        Arc::new(FlowRegistry::from_definitions(flows).unwrap()),
        EngineConfig {
            id_seed: Some(3),
            ..EngineConfig::default()
        },
        Arc::new(RecordingBackend::new()),
        Arc::new(RecordingTimers::new()),
    )
    .unwrap()
    .with_observer(Arc::new(observer));

    // Act
    let outputs = engine.process("greeting", Payload::new()).unwrap();

    // Assert
    assert_eq!(outputs.len(), 1);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.instances_spawned, 2);
    assert_eq!(snapshot.instances_finished, 1);
    assert_eq!(snapshot.emissions_overridden, 1);
    assert_eq!(snapshot.actions_dispatched, 1);
    assert!(recorder.event_types().contains(&"emission.overridden"));
}
