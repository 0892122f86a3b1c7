use rust_fastbert::pipelines::adaptive_classification::{
    AdaptiveClassificationConfig, FastBertClassifier,
};
use rust_fastbert::{
    CascadeConfig, CascadeExecutor, CascadeInput, CascadeSchedule, FastBertError, RenameMaps,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Execution engine stub: one fixed probability table per classifier head,
/// indexed by position within the batch. The flattened output stream is
/// generated with the same schedule the router replays, the way the real
/// engine's static-shape batching behaves.
struct MockExecutor {
    head_probs: Vec<Vec<Vec<f64>>>,
    num_devices: usize,
}

impl MockExecutor {
    fn probs_for(&self, head: usize, row: usize, label_size: usize) -> Vec<f64> {
        self.head_probs
            .get(head)
            .and_then(|rows| rows.get(row))
            .cloned()
            .unwrap_or_else(|| vec![1.0 / label_size as f64; label_size])
    }
}

impl CascadeExecutor for MockExecutor {
    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn forward_cascade(
        &self,
        input: &CascadeInput,
        schedule: &CascadeSchedule,
    ) -> Result<Vec<Vec<f64>>, FastBertError> {
        let batch_size = input.input_ids.size()[0] as usize;
        let shard_size = batch_size / self.num_devices;
        let mut stream = Vec::new();
        for device in 0..self.num_devices {
            let mut unfinished: Vec<usize> =
                (device * shard_size..(device + 1) * shard_size).collect();
            for (loop_index, &head) in schedule.keep_heads().iter().enumerate() {
                let mut next_unfinished = Vec::new();
                for &row in &unfinished {
                    let probs = self.probs_for(head, row, schedule.label_size());
                    if !schedule.resolves(&probs, loop_index) {
                        next_unfinished.push(row);
                    }
                    stream.push(probs);
                }
                unfinished = next_unfinished;
                if unfinished.is_empty() {
                    break;
                }
            }
        }
        Ok(stream)
    }

    fn export(
        &self,
        path: &Path,
        _schedule: &CascadeSchedule,
        _rename_maps: &RenameMaps,
    ) -> Result<(), FastBertError> {
        std::fs::write(path, b"exported graph")?;
        Ok(())
    }
}

fn write_fixtures(directory: &TempDir) -> anyhow::Result<(PathBuf, PathBuf)> {
    let config_path = directory.path().join("config.json");
    let vocab_path = directory.path().join("vocab.txt");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "vocab_size": 12,
            "hidden_size": 16,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "intermediate_size": 32,
            "max_position_embeddings": 64,
            "type_vocab_size": 2,
            "initializer_range": 0.02,
            "id2label": {"0": "negative", "1": "positive"}
        })
        .to_string(),
    )?;
    std::fs::write(
        &vocab_path,
        "[PAD]\n[UNK]\n[CLS]\n[SEP]\n[MASK]\nthis\nmovie\nis\ngreat\nterrible\na\nthe\n",
    )?;
    Ok((config_path, vocab_path))
}

fn classifier(
    executor: MockExecutor,
) -> anyhow::Result<(FastBertClassifier<MockExecutor>, TempDir)> {
    let directory = TempDir::new()?;
    let (config_path, vocab_path) = write_fixtures(&directory)?;
    let config = AdaptiveClassificationConfig::new(config_path, vocab_path, 2);
    let classifier = FastBertClassifier::new(config, executor)?;
    Ok((classifier, directory))
}

/// Rows 0-2 are confident at head 0, row 3 stays uncertain until the forced
/// exit at the deepest head.
fn scenario_executor(num_devices: usize) -> MockExecutor {
    MockExecutor {
        head_probs: vec![
            vec![
                vec![0.99, 0.01],
                vec![0.005, 0.995],
                vec![0.99, 0.01],
                vec![0.5, 0.5],
            ],
            vec![
                vec![0.9, 0.1],
                vec![0.1, 0.9],
                vec![0.9, 0.1],
                vec![0.6, 0.4],
            ],
            vec![
                vec![0.8, 0.2],
                vec![0.2, 0.8],
                vec![0.8, 0.2],
                vec![0.45, 0.55],
            ],
        ],
        num_devices,
    }
}

const INPUTS: [&str; 4] = [
    "this movie is great",
    "this movie is terrible",
    "a great movie",
    "the movie",
];

#[test]
fn predict_adaptive_exits() -> anyhow::Result<()> {
    let (mut classifier, _directory) = classifier(scenario_executor(1))?;
    let cascade = CascadeConfig::new(0.1, &[])?;
    let output = classifier.predict(&INPUTS, 8, &cascade)?;

    assert_eq!(output.sources, vec![0, 0, 0, 2]);
    assert_eq!(output.preds, vec![0, 1, 0, 1]);
    assert_eq!(
        output.labels,
        Some(vec![
            String::from("negative"),
            String::from("positive"),
            String::from("negative"),
            String::from("positive"),
        ])
    );
    assert_eq!(output.probs[3], vec![0.45, 0.55]);

    // determinism: a second run yields identical outputs
    let rerun = classifier.predict(&INPUTS, 8, &cascade)?;
    assert_eq!(output.preds, rerun.preds);
    assert_eq!(output.sources, rerun.sources);
    assert_eq!(output.probs, rerun.probs);
    Ok(())
}

#[test]
fn predict_across_two_devices() -> anyhow::Result<()> {
    let (mut classifier, _directory) = classifier(scenario_executor(2))?;
    let cascade = CascadeConfig::new(0.1, &[])?;
    let output = classifier.predict(&INPUTS, 4, &cascade)?;
    assert_eq!(output.sources, vec![0, 0, 0, 2]);
    assert_eq!(output.preds, vec![0, 1, 0, 1]);
    Ok(())
}

#[test]
fn ignored_heads_are_never_sources() -> anyhow::Result<()> {
    let (mut classifier, _directory) = classifier(scenario_executor(1))?;
    let cascade = CascadeConfig::from_ignore_spec(0.1, "0,1")?;
    let output = classifier.predict(&INPUTS, 8, &cascade)?;
    assert_eq!(output.sources, vec![2, 2, 2, 2]);
    Ok(())
}

#[test]
fn partial_batch_is_padded_and_truncated() -> anyhow::Result<()> {
    let (mut classifier, _directory) = classifier(scenario_executor(1))?;
    let cascade = CascadeConfig::new(0.1, &[])?;
    let output = classifier.predict(&INPUTS[..3], 2, &cascade)?;
    assert_eq!(output.preds.len(), 3);
    assert_eq!(output.sources.len(), 3);
    assert!(output.probs.iter().all(|row| row.len() == 2));
    Ok(())
}

#[test]
fn score_computes_accuracy_and_weighted_loss() -> anyhow::Result<()> {
    let (mut classifier, _directory) = classifier(scenario_executor(1))?;
    // speed 0 never clears the threshold: every example exits at head 2
    let cascade = CascadeConfig::new(0.0, &[])?;
    let labels = [0i64, 1, 1, 1];
    let weights = [1.0f64, 1.0, 2.0, 1.0];
    let output = classifier.score(&INPUTS, &labels, Some(&weights), 8, &cascade)?;

    // head 2 predictions are [0, 1, 0, 1]: three of four correct
    assert!((output.accuracy - 0.75).abs() < 1e-12);
    let expected_loss = (-(0.8f64.ln()) - 0.8f64.ln() - 2.0 * 0.2f64.ln() - 0.55f64.ln()) / 4.0;
    assert!((output.loss - expected_loss).abs() < 1e-12);
    Ok(())
}

#[test]
fn export_delegates_to_executor() -> anyhow::Result<()> {
    let (mut classifier, directory) = classifier(scenario_executor(1))?;
    let cascade = CascadeConfig::new(0.1, &[])?;
    let export_path = directory.path().join("exported.graph");
    classifier.export(&export_path, &cascade, &RenameMaps::default())?;
    assert!(export_path.exists());
    Ok(())
}

#[test]
fn zero_label_size_fails_at_construction() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (config_path, vocab_path) = write_fixtures(&directory)?;
    let config = AdaptiveClassificationConfig::new(config_path, vocab_path, 0);
    let result = FastBertClassifier::new(config, scenario_executor(1));
    assert!(matches!(
        result,
        Err(FastBertError::MissingConfigurationError(_))
    ));
    Ok(())
}

#[test]
fn invalid_cascade_configuration_is_rejected() -> anyhow::Result<()> {
    let (mut classifier, _directory) = classifier(scenario_executor(1))?;
    assert!(CascadeConfig::new(1.5, &[]).is_err());
    // ignoring every head leaves no exit point
    let cascade = CascadeConfig::new(0.1, &[0, 1, 2])?;
    assert!(matches!(
        classifier.predict(&INPUTS, 8, &cascade),
        Err(FastBertError::InvalidConfigurationError(_))
    ));
    Ok(())
}
