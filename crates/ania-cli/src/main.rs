use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command, ValueHint};
use log::LevelFilter;
use serde::Serialize;
use std::path::PathBuf;

use ania_cli::mic::fine_tune::input::MicFineTuneConfig;
use ania_cli::mic::fine_tune::tuner;
use ania_cli::mic::test::input::MicTestConfig;
use ania_cli::mic::test::tester;
use ania_cli::mic::train::input::MicTrainConfig;
use ania_cli::mic::train::trainer;
use ania_mic::models::model_interface::MODEL_TYPES;

fn config_arg() -> Arg {
    Arg::new("config")
        .help("Path to the JSON configuration file. Prints a default template when omitted.")
        .required(false)
        .value_parser(clap::value_parser!(PathBuf))
        .value_hint(ValueHint::FilePath)
}

fn device_arg() -> Arg {
    Arg::new("device")
        .long("device")
        .help("Execution device (cpu, cuda, cuda:N, metal). Overrides the configuration file.")
        .value_parser(clap::builder::NonEmptyStringValueParser::new())
        .value_hint(ValueHint::Other)
}

fn model_path_arg() -> Arg {
    Arg::new("model_path")
        .short('m')
        .long("model")
        .help("Path to a saved model (*.json sidecar or *.safetensors)")
        .value_parser(clap::builder::NonEmptyStringValueParser::new())
        .value_hint(ValueHint::FilePath)
}

fn main() -> Result<()> {
    env_logger::Builder::default()
        .filter_level(LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("ANIA_LOG", "error,ania=info"))
        .init();

    let matches = Command::new("ania")
        .version(clap::crate_version!())
        .about("\u{1F9EC} ANIA CLI - Antimicrobial peptide MIC regression with Inception and attention")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("train")
                .about("Search a hyperparameter grid and save the best model")
                .arg(config_arg())
                .arg(
                    Arg::new("model_type")
                        .short('t')
                        .long("model_type")
                        .help("Model type to train. Overrides the configuration file.")
                        .value_parser(clap::builder::PossibleValuesParser::new(MODEL_TYPES.iter().copied())),
                )
                .arg(
                    Arg::new("hyperparameter_grid")
                        .short('g')
                        .long("grid")
                        .help("Path to the hyperparameter grid JSON")
                        .value_parser(clap::builder::NonEmptyStringValueParser::new())
                        .value_hint(ValueHint::FilePath),
                )
                .arg(
                    Arg::new("output_path")
                        .short('o')
                        .long("output_path")
                        .help("Base path of the saved model; '_full.safetensors' and '_full.json' are appended")
                        .value_parser(clap::builder::NonEmptyStringValueParser::new())
                        .value_hint(ValueHint::FilePath),
                )
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("fine-tune")
                .about("Continue training a saved model on new data")
                .arg(config_arg())
                .arg(model_path_arg())
                .arg(
                    Arg::new("output_path")
                        .short('o')
                        .long("output_path")
                        .help("Base path of the fine-tuned model; '_finetuned_full.*' is appended")
                        .value_parser(clap::builder::NonEmptyStringValueParser::new())
                        .value_hint(ValueHint::FilePath),
                )
                .arg(
                    Arg::new("epochs")
                        .short('e')
                        .long("epochs")
                        .help("Number of fine-tuning epochs")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("unfreeze_inception")
                        .long("unfreeze-inception")
                        .help("Also update the Inception extractor weights")
                        .action(ArgAction::SetTrue),
                )
                .arg(device_arg()),
        )
        .subcommand(
            Command::new("test")
                .about("Predict a held-out set with a saved model and report regression metrics")
                .arg(config_arg())
                .arg(model_path_arg())
                .arg(
                    Arg::new("output_file")
                        .short('o')
                        .long("output_file")
                        .help("Path to the prediction table (*.tsv or *.csv)")
                        .value_parser(clap::builder::NonEmptyStringValueParser::new())
                        .value_hint(ValueHint::FilePath),
                )
                .arg(device_arg()),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    match matches.subcommand() {
        Some(("train", sub_m)) => handle_train(sub_m),
        Some(("fine-tune", sub_m)) => handle_fine_tune(sub_m),
        Some(("test", sub_m)) => handle_test(sub_m),
        _ => unreachable!("Subcommand is required by CLI configuration"),
    }
}

/// Prints the default `T` as JSON when no config file was given.
fn config_or_template<'a, T: Serialize + Default>(matches: &'a ArgMatches) -> Option<&'a PathBuf> {
    let config_path = matches.get_one::<PathBuf>("config");
    if config_path.is_none() {
        eprintln!("[ANIA] No config file provided; printing the default configuration template.");
        println!(
            "{}",
            serde_json::to_string_pretty(&T::default()).unwrap_or_default()
        );
    }
    config_path
}

fn handle_train(matches: &ArgMatches) -> Result<()> {
    let Some(config_path) = config_or_template::<MicTrainConfig>(matches) else {
        return Ok(());
    };
    log::info!("[ANIA::Train] Training from config: {:?}", config_path);

    let params = MicTrainConfig::from_arguments(config_path, matches)?;
    match trainer::run_training(&params) {
        Ok(_) => Ok(()),
        Err(e) => {
            log::error!("Training failed: {:#}", e);
            std::process::exit(1)
        }
    }
}

fn handle_fine_tune(matches: &ArgMatches) -> Result<()> {
    let Some(config_path) = config_or_template::<MicFineTuneConfig>(matches) else {
        return Ok(());
    };
    log::info!("[ANIA::FineTune] Fine-tuning from config: {:?}", config_path);

    let params = MicFineTuneConfig::from_arguments(config_path, matches)?;
    match tuner::run_fine_tuning(&params) {
        Ok(_) => Ok(()),
        Err(e) => {
            log::error!("Fine-tuning failed: {:#}", e);
            std::process::exit(1)
        }
    }
}

fn handle_test(matches: &ArgMatches) -> Result<()> {
    let Some(config_path) = config_or_template::<MicTestConfig>(matches) else {
        return Ok(());
    };
    log::info!("[ANIA::Test] Testing with config: {:?}", config_path);

    let params = MicTestConfig::from_arguments(config_path, matches)?;
    match tester::run_testing(&params) {
        Ok(_) => Ok(()),
        Err(e) => {
            log::error!("Testing failed: {:#}", e);
            std::process::exit(1)
        }
    }
}
