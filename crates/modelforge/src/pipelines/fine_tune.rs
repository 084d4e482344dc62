//! The default fine-tune pipeline:
//! `train -> [resize] -> [quantize] -> export -> write-manifest -> [publish]`.
//!
//! Stage bodies are dry-run simulations: they log the real steps and emit
//! tiny placeholder artifacts under `<models_dir>/<model_id>/`, while the
//! actual training, quantization and export work is delegated to external
//! tooling outside this crate. The engine treats each body as an opaque
//! operation either way.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config;
use crate::jobs::{JobContext, Stage, StageFailure, StageFn, StageResult};

/// Settings injected by the composition root.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub models_dir: PathBuf,
}

impl PipelineSettings {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn from_data_dir() -> Result<Self, io::Error> {
        Ok(Self {
            models_dir: config::default_models_dir()?,
        })
    }
}

/// Build the stage list for a fine-tune job. `resize`, `quantize` and
/// `publish` run only when their parameter blocks are present and non-empty.
pub fn fine_tune_pipeline(settings: &PipelineSettings) -> Vec<Stage> {
    let dir = settings.models_dir.clone();
    vec![
        Stage::new("train", 60, Arc::new(TrainStage { models_dir: dir.clone() })),
        Stage::new("resize", 70, Arc::new(ResizeStage { models_dir: dir.clone() }))
            .optional("resize"),
        Stage::new("quantize", 75, Arc::new(QuantizeStage { models_dir: dir.clone() }))
            .optional("quantize"),
        Stage::new("export", 90, Arc::new(ExportStage { models_dir: dir.clone() })),
        Stage::new("write-manifest", 95, Arc::new(ManifestStage { models_dir: dir })),
        Stage::new("publish", 100, Arc::new(PublishStage)).optional("publish"),
    ]
}

fn io_failure(what: &str, e: io::Error) -> StageFailure {
    StageFailure::new(format!("{}: {}", what, e))
}

/// Resolve the model directory produced by the train stage.
async fn model_dir(ctx: &JobContext, models_dir: &Path) -> Result<(String, PathBuf), StageFailure> {
    let model_id = ctx
        .artifact("model_id")
        .await
        .ok_or_else(|| StageFailure::new("no model_id artifact from the train stage"))?;
    Ok((model_id.clone(), models_dir.join(model_id)))
}

struct TrainStage {
    models_dir: PathBuf,
}

/// Simulated fine-tune variants, selected by the `fine_tune_method` param.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FineTuneMethod {
    Lora,
    Rlhf,
    Dpo,
}

impl FineTuneMethod {
    /// Resolve the requested method, logging the LoRA fallback for
    /// unimplemented or unknown methods.
    async fn resolve(ctx: &JobContext) -> Self {
        let requested = ctx
            .param("fine_tune_method")
            .await
            .and_then(|v| v.as_str().map(str::to_string));
        match requested.as_deref() {
            None | Some("lora") => FineTuneMethod::Lora,
            Some("rlhf") => FineTuneMethod::Rlhf,
            Some("dpo") => FineTuneMethod::Dpo,
            Some("full_finetune") => {
                ctx.log("Full fine-tune not implemented; falling back to LoRA")
                    .await;
                FineTuneMethod::Lora
            }
            Some(other) => {
                ctx.log(format!(
                    "Unknown fine-tune method '{}'; falling back to LoRA",
                    other
                ))
                .await;
                FineTuneMethod::Lora
            }
        }
    }

    fn banner(&self) -> &'static str {
        match self {
            FineTuneMethod::Lora => "[LoRA] Starting fine-tune (dry run)",
            FineTuneMethod::Rlhf => {
                "[RLHF] Starting preference collection and policy optimization (dry run)"
            }
            FineTuneMethod::Dpo => "[DPO] Starting direct preference optimization (dry run)",
        }
    }

    fn steps(&self) -> [&'static str; 5] {
        match self {
            FineTuneMethod::Lora => [
                "Loading base model",
                "Preparing dataset",
                "Attaching LoRA adapters",
                "Training loop",
                "Saving adapters",
            ],
            FineTuneMethod::Rlhf => [
                "Loading base model",
                "Collecting preferences (simulated)",
                "Computing rewards (simulated)",
                "Policy optimization",
                "Saving policy",
            ],
            FineTuneMethod::Dpo => [
                "Loading base model",
                "Loading preference dataset (simulated)",
                "Computing preference loss",
                "Optimizing policy",
                "Saving adapters/policy",
            ],
        }
    }

    fn model_id_prefix(&self) -> &'static str {
        match self {
            FineTuneMethod::Lora => "model",
            FineTuneMethod::Rlhf => "rlhf",
            FineTuneMethod::Dpo => "dpo",
        }
    }

    fn weights_file(&self) -> &'static str {
        match self {
            FineTuneMethod::Lora => "lora_adapter.safetensors",
            FineTuneMethod::Rlhf => "rlhf_policy.safetensors",
            FineTuneMethod::Dpo => "dpo_policy.safetensors",
        }
    }

    fn placeholder(&self) -> &'static [u8] {
        match self {
            FineTuneMethod::Lora => b"SFT_PLACEHOLDER",
            FineTuneMethod::Rlhf => b"RLHF_PLACEHOLDER",
            FineTuneMethod::Dpo => b"DPO_PLACEHOLDER",
        }
    }

    fn artifact_key(&self) -> &'static str {
        match self {
            FineTuneMethod::Lora => "adapter",
            FineTuneMethod::Rlhf | FineTuneMethod::Dpo => "policy",
        }
    }
}

#[async_trait]
impl StageFn for TrainStage {
    async fn run(&self, ctx: &JobContext) -> StageResult {
        let method = FineTuneMethod::resolve(ctx).await;
        let model_id = format!(
            "{}-{}",
            method.model_id_prefix(),
            Utc::now().timestamp_millis()
        );
        let outdir = self.models_dir.join(&model_id);
        fs::create_dir_all(&outdir).map_err(|e| io_failure("failed to create model dir", e))?;

        ctx.log(method.banner()).await;
        let steps = method.steps();
        for (i, step) in steps.iter().enumerate() {
            ctx.log(*step).await;
            ctx.set_progress(((i + 1) * 60 / steps.len()) as u8).await;
        }

        let weights = outdir.join(method.weights_file());
        fs::write(&weights, method.placeholder())
            .map_err(|e| io_failure("failed to write model weights", e))?;
        ctx.log(format!("Artifacts at {}", outdir.display())).await;

        let mut artifacts = HashMap::new();
        artifacts.insert("model_id".to_string(), model_id);
        artifacts.insert(
            method.artifact_key().to_string(),
            weights.display().to_string(),
        );
        Ok(artifacts)
    }
}

struct ResizeStage {
    models_dir: PathBuf,
}

#[async_trait]
impl StageFn for ResizeStage {
    async fn run(&self, ctx: &JobContext) -> StageResult {
        let (_, outdir) = model_dir(ctx, &self.models_dir).await?;
        let settings = ctx.param("resize").await.unwrap_or_default();
        ctx.log(format!("Resizer: {}", settings)).await;

        let marker = outdir.join("resize.txt");
        fs::write(&marker, settings.to_string())
            .map_err(|e| io_failure("failed to write resize marker", e))?;

        let mut artifacts = HashMap::new();
        artifacts.insert("resize".to_string(), marker.display().to_string());
        Ok(artifacts)
    }
}

struct QuantizeStage {
    models_dir: PathBuf,
}

fn quantize_method(value: Option<serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s,
        Some(serde_json::Value::Object(o)) => o
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("int8")
            .to_string(),
        _ => "int8".to_string(),
    }
}

#[async_trait]
impl StageFn for QuantizeStage {
    async fn run(&self, ctx: &JobContext) -> StageResult {
        let (_, outdir) = model_dir(ctx, &self.models_dir).await?;
        let method = quantize_method(ctx.param("quantize").await);
        ctx.log(format!("Quantization: {}", method)).await;

        // Real runs would invoke GPTQ/AWQ tooling here.
        let marker = outdir.join(format!("quant_{}.txt", method));
        fs::write(&marker, "quantized")
            .map_err(|e| io_failure("failed to write quantization marker", e))?;

        let mut artifacts = HashMap::new();
        artifacts.insert("quantized".to_string(), marker.display().to_string());
        Ok(artifacts)
    }
}

struct ExportStage {
    models_dir: PathBuf,
}

#[async_trait]
impl StageFn for ExportStage {
    async fn run(&self, ctx: &JobContext) -> StageResult {
        let (model_id, outdir) = model_dir(ctx, &self.models_dir).await?;
        let format = ctx
            .param("export_format")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "gguf".to_string());
        ctx.log(format!("Export: format={}", format)).await;

        let out = if format == "gguf" {
            outdir.join(format!("{}.gguf", model_id))
        } else {
            outdir.join(format!("{}.safetensors", model_id))
        };
        fs::write(&out, b"EXPORT_PLACEHOLDER")
            .map_err(|e| io_failure("failed to write export", e))?;

        let mut artifacts = HashMap::new();
        artifacts.insert("export".to_string(), out.display().to_string());
        Ok(artifacts)
    }
}

struct ManifestStage {
    models_dir: PathBuf,
}

#[async_trait]
impl StageFn for ManifestStage {
    async fn run(&self, ctx: &JobContext) -> StageResult {
        let (_, outdir) = model_dir(ctx, &self.models_dir).await?;
        let export = ctx
            .artifact("export")
            .await
            .ok_or_else(|| StageFailure::new("no export artifact to reference in Modelfile"))?;
        let base_model = ctx
            .param("base_model_id")
            .await
            .or(ctx.param("base_model_source").await)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        let export_name = Path::new(&export)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("model.gguf")
            .to_string();

        let content = format!(
            "FROM {}\n\n\
             # metadata\n\
             PARAMETER temperature 0.7\n\
             TEMPLATE \"You are a helpful assistant.\"\n\
             LICENSE \"MIT or Apache-2.0 (verify base model)\"\n\
             # base_model: {}\n\
             # date: {}\n",
            export_name,
            base_model,
            Utc::now().to_rfc3339(),
        );

        let manifest = outdir.join("Modelfile");
        fs::write(&manifest, content)
            .map_err(|e| io_failure("failed to write Modelfile", e))?;
        ctx.log(format!("Wrote manifest {}", manifest.display())).await;

        let mut artifacts = HashMap::new();
        artifacts.insert("modelfile".to_string(), manifest.display().to_string());
        Ok(artifacts)
    }
}

struct PublishStage;

#[async_trait]
impl StageFn for PublishStage {
    async fn run(&self, ctx: &JobContext) -> StageResult {
        let model_id = ctx
            .artifact("model_id")
            .await
            .ok_or_else(|| StageFailure::new("no model_id artifact from the train stage"))?;
        let tag = match ctx.param("publish").await {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s,
            Some(serde_json::Value::Object(o)) => o
                .get("tag")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}:latest", model_id)),
            _ => format!("{}:latest", model_id),
        };

        // Pushing to an actual registry is delegated to external tooling.
        ctx.log(format!("Publishing {} to the local Ollama registry", tag))
            .await;

        let mut artifacts = HashMap::new();
        artifacts.insert("published_tag".to_string(), tag);
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobManager, JobStatus, JobStore, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_dry_run_pipeline_completes() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));
        let manager = JobManager::with_policy(store, fast_policy()).await.unwrap();
        let settings = PipelineSettings::new(dir.path().join("models"));

        let mut params = HashMap::new();
        params.insert("base_model_id".to_string(), json!("unsloth/llama-3-8b"));
        let id = manager
            .submit("fine-tune", params, fine_tune_pipeline(&settings))
            .await
            .unwrap();
        manager.wait(id).await.unwrap();

        let status = manager.status(id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.error.is_none());

        let model_id = status.artifacts.get("model_id").unwrap();
        assert!(model_id.starts_with("model-"));
        for key in ["adapter", "export", "modelfile"] {
            let path = PathBuf::from(status.artifacts.get(key).unwrap());
            assert!(path.exists(), "missing {} artifact", key);
        }
        // Optional stages were skipped without penalty.
        assert!(!status.artifacts.contains_key("resize"));
        assert!(!status.artifacts.contains_key("quantized"));
        assert!(!status.artifacts.contains_key("published_tag"));

        let manifest =
            fs::read_to_string(status.artifacts.get("modelfile").unwrap()).unwrap();
        assert!(manifest.starts_with(&format!("FROM {}.gguf", model_id)));
        assert!(manifest.contains("# base_model: unsloth/llama-3-8b"));
    }

    #[tokio::test]
    async fn test_optional_stages_run_when_configured() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));
        let manager = JobManager::with_policy(store, fast_policy()).await.unwrap();
        let settings = PipelineSettings::new(dir.path().join("models"));

        let mut params = HashMap::new();
        params.insert("quantize".to_string(), json!({"method": "q4_k_m"}));
        params.insert("resize".to_string(), json!({"target_layers": 24}));
        params.insert("publish".to_string(), json!({"tag": "mymodel:dev"}));
        let id = manager
            .submit("fine-tune", params, fine_tune_pipeline(&settings))
            .await
            .unwrap();
        manager.wait(id).await.unwrap();

        let status = manager.status(id).await.unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        let quant = PathBuf::from(status.artifacts.get("quantized").unwrap());
        assert!(quant.ends_with("quant_q4_k_m.txt"));
        assert!(quant.exists());
        assert!(PathBuf::from(status.artifacts.get("resize").unwrap()).exists());
        assert_eq!(
            status.artifacts.get("published_tag").map(String::as_str),
            Some("mymodel:dev")
        );
    }

    #[tokio::test]
    async fn test_rlhf_and_dpo_methods_emit_policy_artifacts() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));
        let manager = JobManager::with_policy(store, fast_policy()).await.unwrap();
        let settings = PipelineSettings::new(dir.path().join("models"));

        for (method, prefix, file, step) in [
            ("rlhf", "rlhf-", "rlhf_policy.safetensors", "Policy optimization"),
            ("dpo", "dpo-", "dpo_policy.safetensors", "Computing preference loss"),
        ] {
            let mut params = HashMap::new();
            params.insert("fine_tune_method".to_string(), json!(method));
            let id = manager
                .submit("fine-tune", params, fine_tune_pipeline(&settings))
                .await
                .unwrap();
            manager.wait(id).await.unwrap();

            let status = manager.status(id).await.unwrap();
            assert_eq!(status.status, JobStatus::Completed);
            assert!(status.artifacts.get("model_id").unwrap().starts_with(prefix));
            let policy = PathBuf::from(status.artifacts.get("policy").unwrap());
            assert!(policy.ends_with(file));
            assert!(policy.exists());
            assert!(!status.artifacts.contains_key("adapter"));

            let record = manager.store().get(id).await.unwrap();
            assert!(record.logs.iter().any(|l| l.contains(step)));
        }
    }

    #[tokio::test]
    async fn test_unimplemented_methods_fall_back_to_lora() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));
        let manager = JobManager::with_policy(store, fast_policy()).await.unwrap();
        let settings = PipelineSettings::new(dir.path().join("models"));

        for (method, notice) in [
            ("full_finetune", "Full fine-tune not implemented"),
            ("qlora", "Unknown fine-tune method 'qlora'"),
        ] {
            let mut params = HashMap::new();
            params.insert("fine_tune_method".to_string(), json!(method));
            let id = manager
                .submit("fine-tune", params, fine_tune_pipeline(&settings))
                .await
                .unwrap();
            manager.wait(id).await.unwrap();

            let status = manager.status(id).await.unwrap();
            assert_eq!(status.status, JobStatus::Completed);
            assert!(status.artifacts.get("model_id").unwrap().starts_with("model-"));
            assert!(status.artifacts.contains_key("adapter"));

            let record = manager.store().get(id).await.unwrap();
            assert!(record.logs.iter().any(|l| l.contains(notice)));
        }
    }

    #[test]
    fn test_quantize_method_forms() {
        assert_eq!(quantize_method(None), "int8");
        assert_eq!(quantize_method(Some(json!("q8_0"))), "q8_0");
        assert_eq!(quantize_method(Some(json!({"method": "awq"}))), "awq");
        assert_eq!(quantize_method(Some(json!({}))), "int8");
    }
}
