use kube::CustomResourceExt;
use virta::crd::analysis::{AnalysisRun, AnalysisTemplate};
use virta::crd::experiment::Experiment;
use virta::crd::rollout::Rollout;

fn main() -> anyhow::Result<()> {
    // Generate the CRDs as a v1 List and print as JSON (kubectl accepts JSON)
    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            Rollout::crd(),
            AnalysisTemplate::crd(),
            AnalysisRun::crd(),
            Experiment::crd(),
        ],
    });
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}
