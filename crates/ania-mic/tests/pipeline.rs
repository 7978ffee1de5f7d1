use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde_json::json;

use ania_mic::error::{root_ania_error, AniaError};
use ania_mic::inference::{
    evaluate_predictions, load_trained_model, predict, read_prediction_table, test_model,
    TestOptions, PREDICTED_COLUMN, TRUE_COLUMN,
};
use ania_mic::models::model_interface::{AniaModel, InputShape, Modality, ModelType};
use ania_mic::training::checkpoint::{load_checkpoint, read_checkpoint_record};
use ania_mic::training::fine_tune::{fine_tune_model, FineTuneOptions};
use ania_mic::training::hyperparams::HyperparameterGrid;
use ania_mic::training::search::{train_model, SearchOptions};
use ania_mic::utils::data_handling::{MetadataTable, MicDataset};

fn fcgr_dataset() -> Result<MicDataset> {
    let device = Device::Cpu;
    let fcgr = Tensor::randn(0f32, 1., (4, 1, 4, 4), &device)?;
    let targets = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 1.5], (4, 1), &device)?;
    MicDataset::new(Some(fcgr), None, targets)
}

fn word_dataset() -> Result<MicDataset> {
    let device = Device::Cpu;
    let word = Tensor::randn(0f32, 1., (4, 3, 6), &device)?;
    let targets = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 1.5], (4, 1), &device)?;
    MicDataset::new(None, Some(word), targets)
}

fn composite_dataset() -> Result<MicDataset> {
    let device = Device::Cpu;
    let fcgr = Tensor::randn(0f32, 1., (4, 1, 4, 4), &device)?;
    let word = Tensor::randn(0f32, 1., (4, 3, 6), &device)?;
    let targets = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 1.5], (4, 1), &device)?;
    MicDataset::new(Some(fcgr), Some(word), targets)
}

fn grid_for(model_type: ModelType, section: serde_json::Value) -> Result<HyperparameterGrid> {
    let mut document = serde_json::Map::new();
    document.insert(model_type.as_str().to_string(), section);
    HyperparameterGrid::from_document(&serde_json::Value::Object(document), model_type)
}

fn single_combination(extra: serde_json::Value) -> Result<HyperparameterGrid> {
    let mut section = json!({
        "inception_out_channels": [8],
        "num_heads": [2],
        "d_model": [8],
        "dense_hidden_dim": [4],
        "dropout_rate": [0.1],
        "optimizer": ["adam"],
        "learning_rate": [0.001],
        "batch_size": [2],
        "epochs": [1],
        "loss_function": ["mse"]
    });
    if let (Some(base), Some(extra)) = (section.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    HyperparameterGrid::from_document(&json!({ "fcgr_ania": section }), ModelType::FcgrAnia)
}

fn cpu_search(output: &Path) -> SearchOptions {
    SearchOptions {
        train_split: 0.5,
        patience: 3,
        mixed_precision: false,
        device: "cpu".to_string(),
        output_path: output.to_path_buf(),
        ..Default::default()
    }
}

/// Values of every Inception variable that an optimizer may update.
fn inception_parameters(model: &dyn AniaModel) -> Result<HashMap<String, Vec<f32>>> {
    let data = model.varmap().data().lock().unwrap();
    let mut out = HashMap::new();
    for (name, var) in data.iter() {
        // running statistics move in training mode regardless of freezing
        if name.starts_with("inception.") && !name.contains("running_") {
            out.insert(name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
        }
    }
    Ok(out)
}

#[test]
fn search_trains_and_saves_fcgr_model() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("fcgr_model");
    let outcome = train_model(
        &fcgr_dataset()?,
        ModelType::FcgrAnia,
        &single_combination(json!({}))?,
        &cpu_search(&output),
    )?;

    assert_eq!(outcome.trials_run, 1);
    assert_eq!(outcome.best_trial, 0);
    assert_eq!(outcome.state.record.input_shape, InputShape::Image([1, 4, 4]));
    let stats = outcome.state.record.train_stats.as_ref().unwrap();
    assert_eq!(stats.train_losses.len(), 1);
    assert_eq!(stats.val_losses.len(), 1);
    assert!(outcome.checkpoint.weights.ends_with("fcgr_model_full.safetensors"));
    assert!(dir.path().join("fcgr_ania_loss_curve_best_combination.html").exists());

    let record = read_checkpoint_record(&outcome.checkpoint.metadata)?;
    assert_eq!(record.model_type, ModelType::FcgrAnia);
    assert!(record.explainability.attn_weights);
    assert!(record
        .explainability
        .gradients
        .contains(&"gradients.branch1x1".to_string()));
    Ok(())
}

#[test]
fn saved_model_predicts_identically_after_reload() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = fcgr_dataset()?;
    let mut outcome = train_model(
        &dataset,
        ModelType::FcgrAnia,
        &single_combination(json!({}))?,
        &cpu_search(&dir.path().join("model")),
    )?;

    let expected = predict(outcome.model.as_mut(), &dataset, 2)?;
    let mut reloaded = load_trained_model(&outcome.checkpoint.metadata, &Device::Cpu)?;
    let actual = predict(reloaded.as_mut(), &dataset, 2)?;
    assert_eq!(expected.len(), 4);
    assert_eq!(expected, actual);

    let metadata = MetadataTable::new(
        vec!["ID".to_string()],
        (0..4).map(|i| vec![format!("AMP{}", i)]).collect(),
    )?;
    let output_file = dir.path().join("predictions.tsv");
    let tested = test_model(
        &outcome.checkpoint.weights,
        &dataset,
        &metadata,
        &TestOptions {
            batch_size: 4,
            device: "cpu".to_string(),
            output_file: output_file.clone(),
        },
    )?;
    let table = read_prediction_table(&output_file)?;
    assert_eq!(table.columns, vec!["ID", TRUE_COLUMN, PREDICTED_COLUMN]);
    assert_eq!(table.len(), 4);
    let metrics = evaluate_predictions(&table, TRUE_COLUMN, PREDICTED_COLUMN)?;
    assert!((metrics.mse - tested.metrics.mse).abs() < 1e-5);
    Ok(())
}

#[test]
fn frozen_fine_tuning_keeps_inception_weights() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = fcgr_dataset()?;
    let trained = train_model(
        &dataset,
        ModelType::FcgrAnia,
        &single_combination(json!({}))?,
        &cpu_search(&dir.path().join("base")),
    )?;
    let before = inception_parameters(trained.model.as_ref())?;
    assert!(!before.is_empty());

    let options = FineTuneOptions {
        epochs: 2,
        batch_size: 2,
        freeze_inception: true,
        mixed_precision: false,
        device: "cpu".to_string(),
        output_path: dir.path().join("base"),
        ..Default::default()
    };
    let tuned = fine_tune_model(&trained.checkpoint.metadata, &dataset, &options)?;
    assert_eq!(inception_parameters(tuned.model.as_ref())?, before);

    let stats = tuned.state.record.fine_tune_stats.as_ref().unwrap();
    assert_eq!(stats.epochs, 2);
    assert_eq!(stats.train_losses.len(), 2);
    assert_eq!(tuned.state.record.hyperparams, trained.state.record.hyperparams);
    assert!(tuned.checkpoint.metadata.ends_with("base_finetuned_full.json"));
    assert!(dir.path().join("fcgr_ania_loss_curve_finetune.html").exists());
    Ok(())
}

#[test]
fn fine_tuning_rejects_a_different_input_shape() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let trained = train_model(
        &fcgr_dataset()?,
        ModelType::FcgrAnia,
        &single_combination(json!({}))?,
        &cpu_search(&dir.path().join("model")),
    )?;

    let device = Device::Cpu;
    let other = MicDataset::new(
        Some(Tensor::randn(0f32, 1., (2, 1, 8, 8), &device)?),
        None,
        Tensor::zeros((2, 1), candle_core::DType::F32, &device)?,
    )?;
    let options = FineTuneOptions {
        device: "cpu".to_string(),
        mixed_precision: false,
        output_path: dir.path().join("model"),
        ..Default::default()
    };
    let err = fine_tune_model(&trained.checkpoint.metadata, &other, &options)
        .err()
        .unwrap();
    assert!(matches!(
        root_ania_error(&err),
        Some(AniaError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn indivisible_attention_width_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let err = train_model(
        &fcgr_dataset()?,
        ModelType::FcgrAnia,
        &single_combination(json!({ "d_model": [10], "num_heads": [4] }))?,
        &cpu_search(&dir.path().join("model")),
    )
    .err()
    .unwrap();
    assert!(matches!(
        root_ania_error(&err),
        Some(AniaError::InvalidHyperparameter(_))
    ));
    Ok(())
}

#[test]
fn search_needs_rows_on_both_sides_of_the_split() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let options = SearchOptions {
        train_split: 1.0,
        ..cpu_search(&dir.path().join("model"))
    };
    let err = train_model(
        &fcgr_dataset()?,
        ModelType::FcgrAnia,
        &single_combination(json!({}))?,
        &options,
    )
    .err()
    .unwrap();
    assert!(matches!(root_ania_error(&err), Some(AniaError::EmptyDataset(_))));
    Ok(())
}

#[test]
fn grid_without_the_model_section_is_unsupported() {
    let err = HyperparameterGrid::from_document(&json!({ "fcgr_ania": {} }), ModelType::Ania).unwrap_err();
    assert!(matches!(
        root_ania_error(&err),
        Some(AniaError::UnsupportedModelType(_))
    ));
}

#[test]
fn search_trains_word_embedding_model_and_reloads_it() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = word_dataset()?;
    let grid = grid_for(
        ModelType::WordEmbeddingAnia,
        json!({
            "inception_out_channels": [8],
            "num_heads": [2],
            "d_model": [8],
            "dense_hidden_dim": [4],
            "dropout_rate": [0.1],
            "optimizer": ["sgd"],
            "learning_rate": [0.01],
            "batch_size": [2],
            "epochs": [2],
            "loss_function": ["smooth_l1"]
        }),
    )?;
    let mut outcome = train_model(
        &dataset,
        ModelType::WordEmbeddingAnia,
        &grid,
        &cpu_search(&dir.path().join("word")),
    )?;
    assert_eq!(outcome.state.record.input_shape, InputShape::Sequence([3, 6]));
    assert!(dir
        .path()
        .join("word_embedding_ania_loss_curve_best_combination.html")
        .exists());

    let loaded = load_checkpoint(&outcome.checkpoint.metadata, &Device::Cpu)?;
    assert!(loaded
        .state
        .record
        .explainability
        .features
        .contains(&"features.branch3x3dbl".to_string()));
    assert!(loaded.state.explainability.grad_cam("output", None).is_ok());

    let mut reloaded = loaded.model;
    assert_eq!(
        predict(outcome.model.as_mut(), &dataset, 2)?,
        predict(reloaded.as_mut(), &dataset, 2)?
    );
    Ok(())
}

#[test]
fn composite_checkpoint_keeps_explainability_per_modality() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dataset = composite_dataset()?;
    let grid = grid_for(
        ModelType::Ania,
        json!({
            "fcgr_inception_out_channels": [4],
            "word_inception_out_channels": [8],
            "num_heads": [2],
            "d_model": [8],
            "dense_hidden_dim": [4],
            "dropout_rate": [0.0],
            "optimizer": ["adamw"],
            "learning_rate": [0.001],
            "batch_size": [2],
            "epochs": [1],
            "loss_function": ["l1"]
        }),
    )?;
    let outcome = train_model(&dataset, ModelType::Ania, &grid, &cpu_search(&dir.path().join("ania")))?;

    let record = read_checkpoint_record(&outcome.checkpoint.metadata)?;
    for name in [
        "features.fcgr.branch1x1",
        "features.word.branch1x1",
        "features.fcgr.output",
        "features.word.output",
    ] {
        assert!(record.explainability.features.contains(&name.to_string()), "{}", name);
    }
    assert!(record
        .explainability
        .gradients
        .contains(&"gradients.word.branch_pool".to_string()));

    let loaded = load_checkpoint(&outcome.checkpoint.metadata, &Device::Cpu)?;
    let explainability = &loaded.state.explainability;
    assert_eq!(explainability.captures.len(), 2);
    assert_eq!(explainability.feature_names(), outcome.state.explainability.feature_names());
    assert!(explainability.grad_cam("output", Some(Modality::Fcgr)).is_ok());
    assert!(explainability.grad_cam("output", Some(Modality::Word)).is_ok());
    let err = explainability.grad_cam("output", None).unwrap_err();
    assert!(matches!(
        root_ania_error(&err),
        Some(AniaError::MissingModality(_))
    ));
    Ok(())
}

#[test]
fn best_trial_has_the_lowest_validation_loss() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outcome = train_model(
        &fcgr_dataset()?,
        ModelType::FcgrAnia,
        &single_combination(json!({ "learning_rate": [0.1, 0.001, 0.0001], "epochs": [2] }))?,
        &cpu_search(&dir.path().join("grid")),
    )?;

    assert_eq!(outcome.trials_run, 3);
    assert_eq!(outcome.trial_losses.len(), 3);
    let (lowest_index, lowest) = outcome
        .trial_losses
        .iter()
        .cloned()
        .enumerate()
        .filter(|(_, loss)| loss.is_finite())
        .fold((usize::MAX, f64::INFINITY), |acc, (i, loss)| if loss < acc.1 { (i, loss) } else { acc });
    assert_eq!(outcome.best_trial, lowest_index);
    let saved = outcome.state.record.val_metrics.as_ref().unwrap();
    assert_eq!(saved.best_val_loss, lowest);

    let stats = outcome.state.record.train_stats.as_ref().unwrap();
    assert_eq!(stats.best_epoch, Some(stats.train_losses.len()));
    Ok(())
}

#[test]
fn random_search_runs_the_requested_number_of_trials() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let grid = single_combination(json!({
        "learning_rate": [0.01, 0.001],
        "dropout_rate": [0.0, 0.1]
    }))?;
    assert_eq!(grid.total_combinations(), 4);

    let options = SearchOptions {
        random_search: true,
        num_random_samples: 2,
        ..cpu_search(&dir.path().join("random"))
    };
    let outcome = train_model(&fcgr_dataset()?, ModelType::FcgrAnia, &grid, &options)?;
    assert_eq!(outcome.trials_run, 2);
    assert_eq!(outcome.trial_losses.len(), 2);
    assert!(outcome.best_trial < 2);
    Ok(())
}

#[test]
fn search_without_a_finite_validation_loss_has_no_viable_model() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let device = Device::Cpu;
    let dataset = MicDataset::new(
        Some(Tensor::randn(0f32, 1., (4, 1, 4, 4), &device)?),
        None,
        Tensor::from_vec(vec![1.0f32, 2.0, f32::NAN, f32::NAN], (4, 1), &device)?,
    )?;
    let output = dir.path().join("nan");
    let err = train_model(
        &dataset,
        ModelType::FcgrAnia,
        &single_combination(json!({ "epochs": [3] }))?,
        &cpu_search(&output),
    )
    .err()
    .unwrap();
    assert!(matches!(root_ania_error(&err), Some(AniaError::NoViableModel)));
    assert!(!dir.path().join("nan_full.json").exists());
    Ok(())
}
