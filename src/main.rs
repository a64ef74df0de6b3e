mod backend;
mod controller;
mod error;
mod failure;
mod gateway;
mod logging;
mod mission;
mod models;
mod registry;
mod scenario;
mod tracker;

use std::sync::Arc;

use clap::{Arg, Command};
use controller::MissionController;
use gateway::ActuationGateway;
use logging::{LogConfig, LogOutput, init_logging, level_for_verbosity, parse_log_level};
use scenario::ScenarioConfig;
use tracing::info;

/// 組み込みデモ（5機編隊、リーダー故障）
const DEMO_SCENARIO: &str = include_str!("../scenarios/leader_failure.yaml");

fn main() {
    let matches = Command::new("swarmctl")
        .version("0.1.0")
        .about("編隊ミッション制御 (Fault-tolerant swarm mission controller)")
        .long_about("複数機の編隊をウェイポイント列に沿って飛行させるミッション制御です。\n\
                     ミッション途中でリーダー機が失われても、残りの機体でミッションを完遂します。")
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .conflicts_with("demo")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
        )
        .arg(
            Arg::new("demo")
                .short('d')
                .long("demo")
                .action(clap::ArgAction::SetTrue)
                .help("組み込みのリーダー故障デモを実行")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: デバッグ, -vv: トレース)")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .default_value("console")
                .value_parser(|s: &str| s.parse::<LogOutput>())
                .help("ログ出力先 (console, file, both)")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .default_value("info")
                .help("ログレベル (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .default_value("logs")
                .help("ログファイルの出力ディレクトリ")
        )
        .get_matches();

    let verbose_level = matches.get_count("verbose");
    let base_level = matches
        .get_one::<String>("log-level")
        .map(|s| parse_log_level(s))
        .unwrap_or(tracing::Level::INFO);
    let log_config = LogConfig {
        level: level_for_verbosity(verbose_level, base_level),
        output: matches
            .get_one::<LogOutput>("log-output")
            .copied()
            .unwrap_or(LogOutput::Console),
        log_dir: matches
            .get_one::<String>("log-dir")
            .cloned()
            .unwrap_or_else(|| "logs".to_string()),
        ..LogConfig::default()
    };

    let _guard = match init_logging(log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("ログ初期化エラー: {}", e);
            std::process::exit(1);
        }
    };

    println!("編隊ミッション制御 - swarmctl v0.1.0");
    println!();

    let scenario = if matches.get_flag("demo") {
        ScenarioConfig::from_yaml(DEMO_SCENARIO)
    } else if let Some(path) = matches.get_one::<String>("scenario") {
        ScenarioConfig::from_file(path)
    } else {
        show_default_help();
        return;
    };

    let scenario = match scenario {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
    };

    if matches.get_flag("info") {
        scenario.print_summary();
        return;
    }

    if let Err(e) = execute_scenario(scenario) {
        eprintln!("エラー: {}", e);
        std::process::exit(1);
    }
}

/// シナリオの実行
fn execute_scenario(scenario: ScenarioConfig) -> Result<(), Box<dyn std::error::Error>> {
    scenario.print_summary();
    println!();

    let registry = scenario.build_registry()?;
    let mission = scenario.build_mission()?;
    let backend = Arc::new(scenario.build_backend(&mission));
    let gateway = ActuationGateway::new(backend, scenario.command_timeout());
    let mut controller = MissionController::new(registry, gateway, mission)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(controller.run())?;

    info!(
        final_state = %report.final_state,
        failures = report.command_failures,
        "ミッション結果"
    );
    println!();
    report.print_summary();

    Ok(())
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  swarmctl [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>  シナリオファイルを指定して実行");
    println!("  -i, --info             シナリオ情報のみ表示");
    println!("  -d, --demo             組み込みのリーダー故障デモを実行");
    println!("  -v, --verbose          詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-output       ログ出力先 (console, file, both)");
    println!("  -h, --help             このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/happy_path.yaml       - 故障なしの基本ミッション");
    println!("  scenarios/leader_failure.yaml   - リーダーが2区間目で墜落");
    println!("  scenarios/stale_telemetry.yaml  - 一部機体の位置取得が欠落");
    println!("  scenarios/adversary_ram.yaml    - リーダーが標的機に体当たり");
    println!();
    println!("例:");
    println!("  swarmctl -s scenarios/leader_failure.yaml");
    println!("  swarmctl -s scenarios/stale_telemetry.yaml -v");
    println!("  swarmctl -s scenarios/adversary_ram.yaml -i");
    println!("  swarmctl --demo");
}
