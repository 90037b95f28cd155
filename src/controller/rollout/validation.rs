//! Rollout spec validation
//!
//! Applied at the boundary before any state change. A violation surfaces as
//! an InvalidSpec condition with a per-field message; the reconcile performs
//! no mutations and does not requeue until the spec changes.

use super::scale;
use crate::crd::rollout::{CanaryStep, Rollout};

/// Validate the full rollout spec. Returns the first violation as a
/// per-field message.
pub fn validate_rollout(rollout: &Rollout) -> Result<(), String> {
    let spec = &rollout.spec;

    if spec.replicas < 0 {
        return Err(format!("spec.replicas must be >= 0, got {}", spec.replicas));
    }

    if spec.min_ready_seconds() < 0 {
        return Err(format!(
            "spec.minReadySeconds must be >= 0, got {}",
            spec.min_ready_seconds()
        ));
    }

    let selector_empty = spec
        .selector
        .match_labels
        .as_ref()
        .map(|l| l.is_empty())
        .unwrap_or(true)
        && spec
            .selector
            .match_expressions
            .as_ref()
            .map(|e| e.is_empty())
            .unwrap_or(true);
    if selector_empty {
        return Err(
            "spec.selector must not be empty: selecting all pods is not allowed".to_string(),
        );
    }

    // Expressions must be renderable as a label query before any listing
    // happens; an unsupported operator would otherwise only surface deep in
    // the reconcile path.
    for (i, expr) in spec.selector.match_expressions.iter().flatten().enumerate() {
        if expr.key.is_empty() {
            return Err(format!(
                "spec.selector.matchExpressions[{}].key must not be empty",
                i
            ));
        }
        let values = expr.values.as_ref().map(|v| v.len()).unwrap_or(0);
        match expr.operator.as_str() {
            "In" | "NotIn" => {
                if values == 0 {
                    return Err(format!(
                        "spec.selector.matchExpressions[{}] with operator {} requires values",
                        i, expr.operator
                    ));
                }
            }
            "Exists" | "DoesNotExist" => {
                if values != 0 {
                    return Err(format!(
                        "spec.selector.matchExpressions[{}] with operator {} must not set values",
                        i, expr.operator
                    ));
                }
            }
            other => {
                return Err(format!(
                    "spec.selector.matchExpressions[{}] has unknown operator: {}",
                    i, other
                ));
            }
        }
    }

    // Pod template labels must be a superset of the selector's matchLabels,
    // or the created ReplicaSets would never select their own pods.
    if let Some(match_labels) = spec.selector.match_labels.as_ref() {
        let template_labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.as_ref());
        for (key, value) in match_labels {
            let covered = template_labels
                .map(|labels| labels.get(key) == Some(value))
                .unwrap_or(false);
            if !covered {
                return Err(format!(
                    "spec.template.metadata.labels must carry selector label {}={}",
                    key, value
                ));
            }
        }
    }

    if spec.progress_deadline_seconds() <= spec.min_ready_seconds() {
        return Err(format!(
            "spec.progressDeadlineSeconds ({}) must be greater than spec.minReadySeconds ({})",
            spec.progress_deadline_seconds(),
            spec.min_ready_seconds()
        ));
    }

    if let Some(restart_at) = spec.restart_at.as_deref() {
        if crate::controller::clock::parse_rfc3339(restart_at).is_none() {
            return Err(format!(
                "spec.restartAt is not a valid RFC3339 timestamp: {}",
                restart_at
            ));
        }
    }

    match (&spec.strategy.blue_green, &spec.strategy.canary) {
        (None, None) => {
            return Err(
                "spec.strategy requires exactly one of blueGreen or canary, got neither"
                    .to_string(),
            )
        }
        (Some(_), Some(_)) => {
            return Err(
                "spec.strategy requires exactly one of blueGreen or canary, got both".to_string(),
            )
        }
        (Some(blue_green), None) => {
            if Some(blue_green.active_service.as_str())
                == blue_green.preview_service.as_deref()
            {
                return Err(
                    "spec.strategy.blueGreen.previewService must differ from activeService"
                        .to_string(),
                );
            }
            if blue_green.active_service.is_empty() {
                return Err("spec.strategy.blueGreen.activeService must not be empty".to_string());
            }
            if let Some(limit) = blue_green.scale_down_delay_revision_limit {
                if limit > spec.revision_history_limit() {
                    return Err(format!(
                        "spec.strategy.blueGreen.scaleDownDelayRevisionLimit ({}) must not exceed spec.revisionHistoryLimit ({})",
                        limit,
                        spec.revision_history_limit()
                    ));
                }
            }
            if blue_green.scale_down_delay_seconds() < 0 {
                return Err(format!(
                    "spec.strategy.blueGreen.scaleDownDelaySeconds must be >= 0, got {}",
                    blue_green.scale_down_delay_seconds()
                ));
            }
        }
        (None, Some(canary)) => {
            if !scale::is_valid_int_or_percent(canary.max_surge()) {
                return Err(format!(
                    "spec.strategy.canary.maxSurge has invalid format: {}",
                    canary.max_surge()
                ));
            }
            if !scale::is_valid_int_or_percent(canary.max_unavailable()) {
                return Err(format!(
                    "spec.strategy.canary.maxUnavailable has invalid format: {}",
                    canary.max_unavailable()
                ));
            }
            let surge = scale::resolve_int_or_percent(canary.max_surge(), spec.replicas, true);
            let unavailable =
                scale::resolve_int_or_percent(canary.max_unavailable(), spec.replicas, false);
            if surge == 0 && unavailable == 0 {
                return Err(
                    "spec.strategy.canary: maxSurge and maxUnavailable must not both be zero"
                        .to_string(),
                );
            }
            for (i, step) in canary.steps.iter().enumerate() {
                validate_step(step, i)?;
            }
            if let Some(routing) = canary.traffic_routing.as_ref() {
                let configured =
                    routing.nginx.is_some() as usize + routing.smi.is_some() as usize;
                if configured != 1 {
                    return Err(
                        "spec.strategy.canary.trafficRouting requires exactly one router"
                            .to_string(),
                    );
                }
                if routing.nginx.is_some() || routing.smi.is_some() {
                    if canary.canary_service.as_deref().unwrap_or("").is_empty() {
                        return Err(
                            "spec.strategy.canary.canaryService is required with trafficRouting"
                                .to_string(),
                        );
                    }
                    if canary.stable_service.as_deref().unwrap_or("").is_empty() {
                        return Err(
                            "spec.strategy.canary.stableService is required with trafficRouting"
                                .to_string(),
                        );
                    }
                }
                if let Some(nginx) = routing.nginx.as_ref() {
                    if nginx.stable_ingress.is_empty() {
                        return Err(
                            "spec.strategy.canary.trafficRouting.nginx.stableIngress must not be empty"
                                .to_string(),
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

/// Each step carries exactly one of setWeight, pause, analysis, experiment.
fn validate_step(step: &CanaryStep, index: usize) -> Result<(), String> {
    let set = step.set_weight.is_some() as usize
        + step.pause.is_some() as usize
        + step.analysis.is_some() as usize
        + step.experiment.is_some() as usize;
    if set != 1 {
        return Err(format!(
            "spec.strategy.canary.steps[{}] must set exactly one of setWeight, pause, analysis, experiment",
            index
        ));
    }

    if let Some(weight) = step.set_weight {
        if !(0..=100).contains(&weight) {
            return Err(format!(
                "spec.strategy.canary.steps[{}].setWeight must be between 0 and 100, got {}",
                index, weight
            ));
        }
    }

    if let Some(pause) = step.pause.as_ref() {
        if let Some(duration) = pause.duration {
            if duration < 0 {
                return Err(format!(
                    "spec.strategy.canary.steps[{}].pause.duration must be >= 0, got {}",
                    index, duration
                ));
            }
        }
    }

    if let Some(analysis) = step.analysis.as_ref() {
        if analysis.template_name.is_empty() {
            return Err(format!(
                "spec.strategy.canary.steps[{}].analysis.templateName must not be empty",
                index
            ));
        }
    }

    if let Some(experiment) = step.experiment.as_ref() {
        if experiment.templates.is_empty() {
            return Err(format!(
                "spec.strategy.canary.steps[{}].experiment.templates must not be empty",
                index
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::rollout::{
        BlueGreenStrategy, CanaryStrategy, NginxTrafficRouting, RolloutPause, RolloutSpec,
        RolloutStrategy, TrafficRouting,
    };
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    fn base_rollout(strategy: RolloutStrategy) -> Rollout {
        Rollout {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: RolloutSpec {
                replicas: 3,
                selector: LabelSelector {
                    match_labels: Some(
                        [("app".to_string(), "demo".to_string())].into_iter().collect(),
                    ),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(
                            [("app".to_string(), "demo".to_string())].into_iter().collect(),
                        ),
                        ..Default::default()
                    }),
                    spec: None,
                },
                strategy,
                min_ready_seconds: None,
                progress_deadline_seconds: None,
                revision_history_limit: None,
                paused: None,
                restart_at: None,
            },
            status: None,
        }
    }

    fn blue_green_strategy() -> RolloutStrategy {
        RolloutStrategy {
            blue_green: Some(BlueGreenStrategy {
                active_service: "demo-active".to_string(),
                preview_service: Some("demo-preview".to_string()),
                preview_replica_count: None,
                auto_promotion_enabled: None,
                auto_promotion_seconds: None,
                scale_down_delay_seconds: None,
                scale_down_delay_revision_limit: None,
            }),
            canary: None,
        }
    }

    fn canary_strategy(steps: Vec<CanaryStep>) -> RolloutStrategy {
        RolloutStrategy {
            blue_green: None,
            canary: Some(CanaryStrategy {
                canary_service: Some("demo-canary".to_string()),
                stable_service: Some("demo-stable".to_string()),
                steps,
                max_surge: None,
                max_unavailable: None,
                traffic_routing: None,
            }),
        }
    }

    #[test]
    fn test_valid_blue_green_passes() {
        assert!(validate_rollout(&base_rollout(blue_green_strategy())).is_ok());
    }

    #[test]
    fn test_valid_canary_passes() {
        let steps = vec![
            CanaryStep {
                set_weight: Some(20),
                ..Default::default()
            },
            CanaryStep {
                pause: Some(RolloutPause { duration: Some(60) }),
                ..Default::default()
            },
        ];
        assert!(validate_rollout(&base_rollout(canary_strategy(steps))).is_ok());
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.replicas = -1;
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("spec.replicas"));
    }

    #[test]
    fn test_empty_selector_rejected() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.selector = LabelSelector::default();
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("spec.selector"));
    }

    #[test]
    fn test_match_expressions_only_selector_is_accepted() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["demo".to_string()]),
            }]),
        };
        // The template-label superset rule only binds matchLabels.
        rollout.spec.template.metadata = Some(ObjectMeta::default());
        assert!(validate_rollout(&rollout).is_ok());
    }

    #[test]
    fn test_match_expression_in_requires_values() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.selector.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "tier".to_string(),
            operator: "In".to_string(),
            values: None,
        }]);
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("requires values"));
    }

    #[test]
    fn test_match_expression_exists_rejects_values() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.selector.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "tier".to_string(),
            operator: "Exists".to_string(),
            values: Some(vec!["web".to_string()]),
        }]);
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("must not set values"));
    }

    #[test]
    fn test_match_expression_unknown_operator_rejected() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.selector.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "tier".to_string(),
            operator: "Matches".to_string(),
            values: None,
        }]);
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("unknown operator"));
    }

    #[test]
    fn test_template_labels_must_cover_selector() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.template.metadata = Some(ObjectMeta::default());
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("spec.template.metadata.labels"));
    }

    #[test]
    fn test_progress_deadline_must_exceed_min_ready() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.min_ready_seconds = Some(600);
        rollout.spec.progress_deadline_seconds = Some(600);
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("progressDeadlineSeconds"));
    }

    #[test]
    fn test_exactly_one_strategy_required() {
        let neither = base_rollout(RolloutStrategy::default());
        assert!(validate_rollout(&neither).unwrap_err().contains("neither"));

        let mut both = base_rollout(blue_green_strategy());
        both.spec.strategy.canary = canary_strategy(vec![]).canary;
        assert!(validate_rollout(&both).unwrap_err().contains("both"));
    }

    #[test]
    fn test_blue_green_services_must_differ() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout
            .spec
            .strategy
            .blue_green
            .as_mut()
            .unwrap()
            .preview_service = Some("demo-active".to_string());
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("previewService"));
    }

    #[test]
    fn test_scale_down_delay_revision_limit_bound() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.revision_history_limit = Some(2);
        rollout
            .spec
            .strategy
            .blue_green
            .as_mut()
            .unwrap()
            .scale_down_delay_revision_limit = Some(5);
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("scaleDownDelayRevisionLimit"));
    }

    #[test]
    fn test_canary_zero_surge_and_unavailable_rejected() {
        let mut rollout = base_rollout(canary_strategy(vec![]));
        let canary = rollout.spec.strategy.canary.as_mut().unwrap();
        canary.max_surge = Some("0".to_string());
        canary.max_unavailable = Some("0%".to_string());
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("both be zero"));
    }

    #[test]
    fn test_step_must_have_exactly_one_field() {
        let steps = vec![CanaryStep {
            set_weight: Some(20),
            pause: Some(RolloutPause::default()),
            ..Default::default()
        }];
        let err = validate_rollout(&base_rollout(canary_strategy(steps))).unwrap_err();
        assert!(err.contains("exactly one"));

        let empty = vec![CanaryStep::default()];
        let err = validate_rollout(&base_rollout(canary_strategy(empty))).unwrap_err();
        assert!(err.contains("exactly one"));
    }

    #[test]
    fn test_set_weight_range() {
        let steps = vec![CanaryStep {
            set_weight: Some(150),
            ..Default::default()
        }];
        let err = validate_rollout(&base_rollout(canary_strategy(steps))).unwrap_err();
        assert!(err.contains("between 0 and 100"));
    }

    #[test]
    fn test_negative_pause_duration_rejected() {
        let steps = vec![CanaryStep {
            pause: Some(RolloutPause { duration: Some(-5) }),
            ..Default::default()
        }];
        let err = validate_rollout(&base_rollout(canary_strategy(steps))).unwrap_err();
        assert!(err.contains("pause.duration"));
    }

    #[test]
    fn test_traffic_routing_requires_services() {
        let mut rollout = base_rollout(canary_strategy(vec![CanaryStep {
            set_weight: Some(50),
            ..Default::default()
        }]));
        let canary = rollout.spec.strategy.canary.as_mut().unwrap();
        canary.canary_service = None;
        canary.traffic_routing = Some(TrafficRouting {
            nginx: Some(NginxTrafficRouting {
                stable_ingress: "demo".to_string(),
                annotation_prefix: None,
                additional_ingress_annotations: None,
            }),
            smi: None,
        });
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("canaryService"));
    }

    #[test]
    fn test_invalid_restart_at_rejected() {
        let mut rollout = base_rollout(blue_green_strategy());
        rollout.spec.restart_at = Some("yesterday".to_string());
        let err = validate_rollout(&rollout).unwrap_err();
        assert!(err.contains("restartAt"));
    }
}
