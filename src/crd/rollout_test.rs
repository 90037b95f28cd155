use super::*;
use kube::CustomResourceExt;

fn minimal_canary_json() -> serde_json::Value {
    serde_json::json!({
        "selector": { "matchLabels": { "app": "demo" } },
        "template": {
            "metadata": { "labels": { "app": "demo" } },
            "spec": { "containers": [ { "name": "app", "image": "demo:1.0" } ] }
        },
        "strategy": {
            "canary": {
                "canaryService": "demo-canary",
                "stableService": "demo-stable",
                "steps": [
                    { "setWeight": 20 },
                    { "pause": { "duration": 60 } },
                    { "setWeight": 100 }
                ]
            }
        }
    })
}

#[test]
fn test_spec_deserializes_with_defaults() {
    let spec: RolloutSpec =
        serde_json::from_value(minimal_canary_json()).expect("spec should deserialize");
    assert_eq!(spec.replicas, 1);
    assert_eq!(spec.min_ready_seconds(), 0);
    assert_eq!(spec.progress_deadline_seconds(), 600);
    assert_eq!(spec.revision_history_limit(), 10);
    assert!(!spec.paused());

    let canary = spec.strategy.canary.expect("canary strategy");
    assert_eq!(canary.max_surge(), "25%");
    assert_eq!(canary.max_unavailable(), "25%");
    assert_eq!(canary.steps.len(), 3);
    assert_eq!(canary.steps[0].set_weight, Some(20));
    assert_eq!(
        canary.steps[1].pause.as_ref().and_then(|p| p.duration),
        Some(60)
    );
}

#[test]
fn test_blue_green_defaults() {
    let blue_green: BlueGreenStrategy = serde_json::from_value(serde_json::json!({
        "activeService": "demo-active"
    }))
    .expect("blue-green should deserialize");
    assert!(blue_green.auto_promotion_enabled());
    assert_eq!(blue_green.scale_down_delay_seconds(), 30);
    assert!(blue_green.preview_service.is_none());
}

#[test]
fn test_status_serializes_wire_field_names() {
    let status = RolloutStatus {
        current_pod_hash: Some("abc123def0".to_string()),
        current_step_index: Some(2),
        available_replicas: 3,
        blue_green: BlueGreenStatus {
            active_selector: Some("abc123def0".to_string()),
            ..Default::default()
        },
        canary: CanaryStatus {
            stable_rs: Some("abc123def0".to_string()),
        },
        ..Default::default()
    };
    let value = serde_json::to_value(&status).expect("status serializes");
    assert_eq!(value["currentPodHash"], "abc123def0");
    assert_eq!(value["currentStepIndex"], 2);
    assert_eq!(value["availableReplicas"], 3);
    assert_eq!(value["blueGreen"]["activeSelector"], "abc123def0");
    assert_eq!(value["canary"]["stableRS"], "abc123def0");
}

#[test]
fn test_status_round_trips() {
    let status = RolloutStatus {
        current_pod_hash: Some("abc".to_string()),
        conditions: vec![RolloutCondition {
            condition_type: RolloutConditionType::Progressing,
            status: ConditionStatus::True,
            last_update_time: "2024-05-01T00:00:00+00:00".to_string(),
            last_transition_time: "2024-05-01T00:00:00+00:00".to_string(),
            reason: "ReplicaSetUpdated".to_string(),
            message: "Rollout is progressing".to_string(),
        }],
        ..Default::default()
    };
    let json = serde_json::to_string(&status).expect("serialize");
    let back: RolloutStatus = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, status);
}

#[test]
fn test_crd_has_expected_identity() {
    let crd = Rollout::crd();
    assert_eq!(crd.spec.group, "virta.io");
    assert_eq!(crd.spec.names.kind, "Rollout");
    assert_eq!(crd.spec.names.plural, "rollouts");
    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version.subresources.as_ref().is_some_and(|s| s.status.is_some()));
}

#[test]
fn test_step_one_of_shape_in_wire_format() {
    let step: CanaryStep = serde_json::from_value(serde_json::json!({
        "analysis": { "templateName": "error-rate", "args": [ { "name": "service", "value": "x" } ] }
    }))
    .expect("analysis step deserializes");
    assert!(step.set_weight.is_none());
    assert!(step.pause.is_none());
    let analysis = step.analysis.expect("analysis present");
    assert_eq!(analysis.template_name, "error-rate");
    assert_eq!(analysis.args.len(), 1);
}
