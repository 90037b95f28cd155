use super::*;
use crate::crd::rollout::{
    CanaryStrategy, RolloutSpec, RolloutStrategy, TrafficRouting,
};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

fn nginx_rollout() -> Rollout {
    Rollout {
        metadata: ObjectMeta {
            name: Some("demo".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("uid-1".to_string()),
            ..Default::default()
        },
        spec: RolloutSpec {
            replicas: 4,
            selector: LabelSelector::default(),
            template: PodTemplateSpec::default(),
            strategy: RolloutStrategy {
                blue_green: None,
                canary: Some(CanaryStrategy {
                    canary_service: Some("demo-canary".to_string()),
                    stable_service: Some("demo-stable".to_string()),
                    steps: vec![],
                    max_surge: None,
                    max_unavailable: None,
                    traffic_routing: Some(TrafficRouting {
                        nginx: Some(NginxTrafficRouting {
                            stable_ingress: "demo-ingress".to_string(),
                            annotation_prefix: None,
                            additional_ingress_annotations: None,
                        }),
                        smi: None,
                    }),
                }),
            },
            min_ready_seconds: None,
            progress_deadline_seconds: None,
            revision_history_limit: None,
            paused: None,
            restart_at: None,
        },
        status: None,
    }
}

fn stable_ingress() -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some("demo-ingress".to_string()),
            namespace: Some("default".to_string()),
            annotations: Some(
                [
                    (
                        "kubectl.kubernetes.io/last-applied-configuration".to_string(),
                        "{...}".to_string(),
                    ),
                    ("meta.helm.sh/release-name".to_string(), "demo".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            labels: Some(
                [
                    ("app.kubernetes.io/instance".to_string(), "demo".to_string()),
                    ("team".to_string(), "platform".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some("demo.example.com".to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: "demo-stable".to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(80),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn config() -> NginxTrafficRouting {
    NginxTrafficRouting {
        stable_ingress: "demo-ingress".to_string(),
        annotation_prefix: None,
        additional_ingress_annotations: None,
    }
}

#[test]
fn test_desired_canary_ingress_shape() {
    let rollout = nginx_rollout();
    let desired = desired_canary_ingress(
        &rollout,
        &config(),
        "demo-stable",
        "demo-canary",
        &stable_ingress(),
        25,
    )
    .unwrap();

    assert_eq!(desired.metadata.name.as_deref(), Some("demo-ingress-canary"));

    let annotations = desired.metadata.annotations.as_ref().unwrap();
    assert_eq!(
        annotations.get("nginx.ingress.kubernetes.io/canary").map(String::as_str),
        Some("true")
    );
    assert_eq!(
        annotations
            .get("nginx.ingress.kubernetes.io/canary-weight")
            .map(String::as_str),
        Some("25")
    );
    // Fields never copied to the companion
    assert!(!annotations.contains_key("kubectl.kubernetes.io/last-applied-configuration"));
    assert!(!desired
        .metadata
        .labels
        .as_ref()
        .unwrap()
        .contains_key("app.kubernetes.io/instance"));

    // Backends repointed at the canary service
    let backend = &desired.spec.as_ref().unwrap().rules.as_ref().unwrap()[0]
        .http
        .as_ref()
        .unwrap()
        .paths[0]
        .backend;
    assert_eq!(
        backend.service.as_ref().unwrap().name.as_str(),
        "demo-canary"
    );

    // Owner-referenced to the rollout
    let owner = &desired.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.uid, "uid-1");
}

#[test]
fn test_desired_canary_ingress_requires_stable_backend() {
    let rollout = nginx_rollout();
    let mut ingress = stable_ingress();
    // Repoint the only rule at an unrelated service.
    ingress.spec.as_mut().unwrap().rules.as_mut().unwrap()[0]
        .http
        .as_mut()
        .unwrap()
        .paths[0]
        .backend
        .service
        .as_mut()
        .unwrap()
        .name = "something-else".to_string();

    let err = desired_canary_ingress(
        &rollout,
        &config(),
        "demo-stable",
        "demo-canary",
        &ingress,
        25,
    )
    .unwrap_err();
    assert!(matches!(err, TrafficError::NoStableBackend(_, _)));
}

#[test]
fn test_additional_annotations_are_prefixed() {
    let rollout = nginx_rollout();
    let mut cfg = config();
    cfg.additional_ingress_annotations = Some(
        [
            ("canary-by-header".to_string(), "X-Canary".to_string()),
            (
                "nginx.ingress.kubernetes.io/canary-by-cookie".to_string(),
                "canary".to_string(),
            ),
        ]
        .into_iter()
        .collect(),
    );
    let desired = desired_canary_ingress(
        &rollout,
        &cfg,
        "demo-stable",
        "demo-canary",
        &stable_ingress(),
        10,
    )
    .unwrap();
    let annotations = desired.metadata.annotations.as_ref().unwrap();
    assert!(annotations.contains_key("nginx.ingress.kubernetes.io/canary-by-header"));
    assert!(annotations.contains_key("nginx.ingress.kubernetes.io/canary-by-cookie"));
}

#[test]
fn test_same_weight_is_a_no_op() {
    // First Reconcile(25) creates the companion; a second Reconcile(25)
    // builds an identical desired state, so no patch is needed.
    let rollout = nginx_rollout();
    let desired_first = desired_canary_ingress(
        &rollout,
        &config(),
        "demo-stable",
        "demo-canary",
        &stable_ingress(),
        25,
    )
    .unwrap();
    let desired_second = desired_canary_ingress(
        &rollout,
        &config(),
        "demo-stable",
        "demo-canary",
        &stable_ingress(),
        25,
    )
    .unwrap();
    assert!(!ingress_needs_update(&desired_first, &desired_second));
}

#[test]
fn test_weight_change_patches_only_weight_annotation() {
    let rollout = nginx_rollout();
    let at_25 = desired_canary_ingress(
        &rollout,
        &config(),
        "demo-stable",
        "demo-canary",
        &stable_ingress(),
        25,
    )
    .unwrap();
    let at_50 = desired_canary_ingress(
        &rollout,
        &config(),
        "demo-stable",
        "demo-canary",
        &stable_ingress(),
        50,
    )
    .unwrap();

    assert!(ingress_needs_update(&at_25, &at_50));
    assert_eq!(at_25.spec, at_50.spec);
    assert_eq!(at_25.metadata.labels, at_50.metadata.labels);

    let a = at_25.metadata.annotations.unwrap();
    let b = at_50.metadata.annotations.unwrap();
    let differing: Vec<_> = b
        .iter()
        .filter(|(k, v)| a.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    assert_eq!(differing, vec!["nginx.ingress.kubernetes.io/canary-weight"]);
}
