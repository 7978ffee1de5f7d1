//! Config parsing, data config and util helpers.

use clap::{Arg, ArgAction, Command};

use ania_cli::mic::fine_tune::input::MicFineTuneConfig;
use ania_cli::mic::load_data::{load_dataset, DataConfig};
use ania_cli::mic::test::input::MicTestConfig;
use ania_cli::mic::train::input::MicTrainConfig;
use ania_cli::mic::util::validate_tsv_or_csv_file;
use ania_mic::error::{root_ania_error, AniaError};
use ania_mic::models::model_interface::ModelType;

#[test]
fn validate_tsv_file_exists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.tsv");
    std::fs::File::create(&path).unwrap();
    assert!(validate_tsv_or_csv_file(path.to_str().unwrap()).is_ok());
}

#[test]
fn validate_wrong_extension_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.txt");
    std::fs::File::create(&path).unwrap();
    assert!(validate_tsv_or_csv_file(path.to_str().unwrap()).is_err());
}

#[test]
fn validate_nonexistent_file_errors() {
    assert!(validate_tsv_or_csv_file("/nonexistent/path/data.csv").is_err());
}

#[test]
fn train_config_defaults() {
    let cfg = MicTrainConfig::default();
    assert_eq!(cfg.model_type, "fcgr_ania");
    assert!((cfg.train_split - 0.8).abs() < 1e-12);
    assert_eq!(cfg.early_stopping_patience, 10);
    assert!(cfg.mixed_precision);
    assert_eq!(cfg.data.fcgr_height * cfg.data.fcgr_width, 256);
}

#[test]
fn fine_tune_and_test_config_defaults() {
    let tune = MicFineTuneConfig::default();
    assert_eq!(tune.epochs, 10);
    assert_eq!(tune.batch_size, 128);
    assert!(tune.freeze_inception);

    let test = MicTestConfig::default();
    assert!(test.batch_size > 0);
    assert!(test.output_file.ends_with(".csv"));
}

#[test]
fn partial_config_keeps_defaults_and_applies_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let grid = dir.path().join("grid.json");
    std::fs::write(&grid, "{}").unwrap();
    let config_path = dir.path().join("train.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "model_type": "ania",
            "hyperparameter_grid": grid.to_str().unwrap(),
            "train_split": "not a number",
            "data": { "max_len": 32 }
        })
        .to_string(),
    )
    .unwrap();

    let matches = Command::new("train")
        .arg(Arg::new("model_type").long("model_type"))
        .arg(Arg::new("hyperparameter_grid").long("grid"))
        .arg(Arg::new("output_path").long("output_path"))
        .arg(Arg::new("device").long("device"))
        .arg(Arg::new("verbose").long("verbose").action(ArgAction::SetTrue))
        .get_matches_from(["train", "--device", "cpu"]);

    let cfg = MicTrainConfig::from_arguments(&config_path, &matches).unwrap();
    assert_eq!(cfg.model_type, "ania");
    assert_eq!(cfg.device, "cpu");
    assert!((cfg.train_split - 0.8).abs() < 1e-12);
    assert_eq!(cfg.data.max_len, 32);
    assert_eq!(cfg.data.fcgr_height, DataConfig::default().fcgr_height);
}

#[test]
fn missing_word_inputs_are_reported() {
    let err = load_dataset(ModelType::WordEmbeddingAnia, &DataConfig::default()).unwrap_err();
    assert!(matches!(
        root_ania_error(&err),
        Some(AniaError::MissingModality(_))
    ));
}

#[test]
fn loads_cgr_table_for_fcgr_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cgr.csv");
    let mut content = String::from("ID,Sequence,Targets,Log MIC Value,f0,f1,f2,f3\n");
    content.push_str("AMP1,KLLK,E. coli,1.5,0.1,0.2,0.3,0.4\n");
    content.push_str("AMP2,GIGK,E. coli,0.5,0.4,0.3,0.2,0.1\n");
    std::fs::write(&path, content).unwrap();

    let data = DataConfig {
        fcgr_data: Some(path.to_str().unwrap().to_string()),
        feature_start_idx: 4,
        feature_end_idx: 7,
        fcgr_height: 2,
        fcgr_width: 2,
        ..Default::default()
    };
    let (dataset, metadata) = load_dataset(ModelType::FcgrAnia, &data).unwrap();
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.fcgr_shape(), Some(vec![1, 2, 2]));
    assert_eq!(metadata.len(), 2);
}

#[test]
fn composite_rows_are_paired_by_id() {
    use candle_core::{Device, Tensor};
    use std::collections::HashMap;

    let dir = tempfile::tempdir().unwrap();
    let cgr = dir.path().join("cgr.csv");
    std::fs::write(
        &cgr,
        "ID,Sequence,Targets,Log MIC Value,f0,f1,f2,f3\n\
         A,KLLK,E. coli,1.0,1,1,1,1\n\
         B,GIGK,E. coli,9.0,9,9,9,9\n",
    )
    .unwrap();
    let word_table = dir.path().join("word.csv");
    std::fs::write(
        &word_table,
        "ID,Sequence,Targets,Log MIC Value\nA,KLLK,E. coli,1.0\nB,GIGK,E. coli,9.0\n",
    )
    .unwrap();
    let ids = dir.path().join("ids.txt");
    std::fs::write(&ids, "B\nA\n").unwrap();

    // archive order B, A with (2, max_len 3, dim 2)
    let encoded = Tensor::from_vec(
        [vec![9f32; 6], vec![1f32; 6]].concat(),
        (2, 3, 2),
        &Device::Cpu,
    )
    .unwrap();
    let archive = dir.path().join("emb.safetensors");
    let tensors: HashMap<String, Tensor> = [("encoded_matrices".to_string(), encoded)].into();
    candle_core::safetensors::save(&tensors, &archive).unwrap();

    let mut data = DataConfig {
        fcgr_data: Some(cgr.to_str().unwrap().to_string()),
        word_embedding_archive: Some(archive.to_str().unwrap().to_string()),
        word_embedding_ids: Some(ids.to_str().unwrap().to_string()),
        word_metadata: Some(word_table.to_str().unwrap().to_string()),
        feature_start_idx: 4,
        feature_end_idx: 7,
        fcgr_height: 2,
        fcgr_width: 2,
        max_len: 3,
        ..Default::default()
    };
    let (dataset, metadata) = load_dataset(ModelType::Ania, &data).unwrap();
    assert_eq!(metadata.column("ID").unwrap(), vec!["B", "A"]);
    assert_eq!(
        dataset.targets().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        vec![9.0, 1.0]
    );
    let fcgr_row0 = dataset.fcgr().unwrap().get(0).unwrap().flatten_all().unwrap();
    let word_row0 = dataset.word().unwrap().get(0).unwrap().flatten_all().unwrap();
    assert_eq!(fcgr_row0.to_vec1::<f32>().unwrap(), vec![9.0; 4]);
    assert_eq!(word_row0.to_vec1::<f32>().unwrap(), vec![9.0; 6]);

    std::fs::write(&ids, "B\nZ\n").unwrap();
    let word_table_z = dir.path().join("word_z.csv");
    std::fs::write(
        &word_table_z,
        "ID,Sequence,Targets,Log MIC Value\nZ,KLLK,E. coli,1.0\nB,GIGK,E. coli,9.0\n",
    )
    .unwrap();
    data.word_metadata = Some(word_table_z.to_str().unwrap().to_string());
    let err = load_dataset(ModelType::Ania, &data).unwrap_err();
    assert!(matches!(
        root_ania_error(&err),
        Some(AniaError::MissingTarget(_))
    ));
}
