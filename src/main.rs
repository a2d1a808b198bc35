use base64::Engine as _;
use clap::Parser;
use dialoguer::Select;
use image_tagger_rust::{api, cli, config, error, manifest, pipeline, scanner};

use api::{ImagePayload, VisionApi, VisionClient};
use cli::{Cli, Commands};
use config::Config;
use error::{Result, TaggerError};
use indicatif::ProgressBar;
use manifest::ManifestManager;
use pipeline::{CancelFlag, ProgressFn, TagRequest};
use scanner::Base64SizeEstimator;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Run {
            input,
            prompt,
            system_prompt,
            concurrency,
            retry,
            max_batch_bytes,
            force_recreate,
        } => {
            let mut config = config;
            config.concurrency = concurrency;
            config.retry_max = retry;
            if let Some(bytes) = max_batch_bytes {
                config.max_batch_size_bytes = bytes;
            }
            run_batch(
                &config,
                &input,
                prompt,
                system_prompt,
                force_recreate,
                cli.verbose,
            )
            .await?;
        }

        Commands::Review { manifest } => {
            review_captions(&manifest)?;
        }

        Commands::Regenerate {
            manifest,
            filepath,
            prompt,
        } => {
            regenerate_caption(&config, &manifest, &filepath, prompt).await?;
        }

        Commands::Export { manifest, output } => {
            println!("📄 image-tagger - キャプション書き出し\n");

            let manager = ManifestManager::load(&manifest)?;
            let base_dir = manifest
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let exported = manager.export_txt_files(base_dir, output.as_deref())?;

            println!("✅ {}件の.txtファイルを書き出しました", exported);
        }

        Commands::Import { folder, manifest } => {
            println!("📥 image-tagger - 画像取り込み\n");

            let manifest_path = manifest.unwrap_or_else(|| folder.join("manifest.csv"));
            let mut manager = ManifestManager::load(&manifest_path)?;
            let imported = manager.import_from_directory(&folder)?;
            manager.save()?;

            println!("✔ 新規 {}件 / 合計 {}件", imported, manager.len());
            println!("✅ manifestを保存: {}", manifest_path.display());
        }

        Commands::Check => {
            check_config(&config).await?;
        }

        Commands::Config {
            set_api_key,
            set_base_url,
            set_model,
            show,
        } => {
            let mut config = config;

            if let Some(key) = set_api_key {
                config.set_api_key(key)?;
                println!("✔ APIキーを設定しました");
            }
            if let Some(url) = set_base_url {
                config.api_base_url = url;
                config.save()?;
                println!("✔ ベースURLを設定しました");
            }
            if let Some(model) = set_model {
                config.model = model;
                config.save()?;
                println!("✔ モデル名を設定しました");
            }

            if show {
                println!("設定:");
                println!("  API URL: {}", config.api_base_url);
                println!("  モデル: {}", config.model);
                println!("  APIキー: {}", mask_api_key(config.api_key.as_deref()));
                println!("  Group ID: {}", config.group_id.as_deref().unwrap_or("未設定"));
                println!("  並行数: {}", config.concurrency);
                println!("  リトライ回数: {}", config.retry_max);
                println!("  チャンク上限: {} bytes", config.max_batch_size_bytes);
            }
        }
    }

    Ok(())
}

/// 一括キャプション生成の実行
async fn run_batch(
    config: &Config,
    input: &Path,
    prompt: String,
    system_prompt: Option<String>,
    force_recreate: bool,
    verbose: bool,
) -> Result<()> {
    println!("📸 image-tagger - 一括キャプション生成\n");

    // ディスパッチ前の致命的な設定エラーはここで止める
    config.validate()?;

    // 1. manifest解決
    println!("[1/3] manifestを準備中...");
    let (mut manager, base_dir) = resolve_manifest(input, force_recreate)?;
    let pending: Vec<PathBuf> = manager
        .pending_records()
        .iter()
        .map(|record| base_dir.join(&record.filepath))
        .collect();

    if pending.is_empty() {
        println!("処理対象のレコードがありません");
        return Ok(());
    }
    println!("✔ 処理対象 {}件\n", pending.len());

    // 2. パイプライン実行
    println!("[2/3] キャプション生成中...");
    let client: Arc<dyn VisionApi> = Arc::new(VisionClient::new(config)?);

    // Ctrl-Cで以降のチャンク投入を止める（実行中の呼び出しは完了を待つ）
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n⚠️ 中断要求を受け付けました。実行中のチャンクの完了を待ちます...");
                cancel.cancel();
            }
        });
    }

    let progress_bar = ProgressBar::new(0);
    let progress: ProgressFn = {
        let progress_bar = progress_bar.clone();
        Arc::new(move |completed, total| {
            if progress_bar.length().unwrap_or(0) != total as u64 {
                progress_bar.set_length(total as u64);
            }
            progress_bar.set_position(completed as u64);
        })
    };

    let request = TagRequest {
        prompt,
        system_prompt: system_prompt.or_else(|| Some(config.system_prompt.clone())),
    };
    let report = pipeline::run_pipeline(
        Arc::clone(&client),
        &pending,
        &request,
        &Base64SizeEstimator,
        &config.pipeline_config(),
        Some(progress),
        cancel,
    )
    .await;
    progress_bar.finish_and_clear();
    println!("✔ 生成完了\n");

    // 3. 結果をmanifestへ反映（キャプションは承認待ちとして保存）
    println!("[3/3] 結果を保存中...");
    for result in &report.results {
        if result.success {
            let filepath = relative_key(&result.path, &base_dir);
            manager.store_generated(&filepath, &result.text);
        } else if verbose {
            eprintln!("⚠️ 生成失敗: {} - {}", result.path.display(), result.text);
        }
    }
    manager.save()?;
    println!("✔ manifestを保存: {}", manager.path().display());

    if !report.skipped.is_empty() {
        println!("\n⚠️ スキップされた画像 {}件:", report.skipped.len());
        for skip in &report.skipped {
            println!("  - {} ({})", skip.path.display(), skip.reason);
        }
    }

    println!(
        "\n✅ 完了: 成功 {}/{} 件（失敗 {}件）",
        report.success_count(),
        report.results.len(),
        report.failure_count()
    );
    Ok(())
}

/// 入力パスからmanifestと画像の基準ディレクトリを解決する
///
/// - CSVファイル: そのmanifestを読み込む（基準は親ディレクトリ）
/// - ディレクトリ: 直下のmanifest.csvを読み込み or 作成し、画像を取り込む
fn resolve_manifest(input: &Path, force_recreate: bool) -> Result<(ManifestManager, PathBuf)> {
    if input.is_file() {
        if input.extension().map(|e| e.to_string_lossy().to_lowercase()) != Some("csv".into()) {
            return Err(TaggerError::Config(format!(
                "未対応の入力ファイルです（CSVのみ）: {}",
                input.display()
            )));
        }
        let manager = ManifestManager::load(input)?;
        let base_dir = input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        return Ok((manager, base_dir));
    }

    if input.is_dir() {
        let manifest_path = input.join("manifest.csv");
        let mut manager = if manifest_path.exists() && !force_recreate {
            ManifestManager::load(&manifest_path)?
        } else {
            // 新規作成（force_recreate時は既存内容を捨てる）
            ManifestManager::new(&manifest_path)
        };

        let imported = manager.import_from_directory(input)?;
        if imported > 0 {
            println!("✔ 新しい画像を{}件取り込みました", imported);
        }
        manager.save()?;
        return Ok((manager, input.to_path_buf()));
    }

    Err(TaggerError::FileNotFound(input.display().to_string()))
}

/// 基準ディレクトリからの相対キーへ変換する
fn relative_key(path: &Path, base_dir: &Path) -> String {
    path.strip_prefix(base_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// 対話的レビュー（承認待ちキャプションの確認）
fn review_captions(manifest_path: &Path) -> Result<()> {
    println!("📝 image-tagger - キャプションレビュー\n");

    let mut manager = ManifestManager::load(manifest_path)?;
    let targets: Vec<String> = manager
        .pending_records()
        .iter()
        .filter(|record| !record.prompt_en.is_empty())
        .map(|record| record.filepath.clone())
        .collect();

    if targets.is_empty() {
        println!("レビュー対象のレコードがありません");
        return Ok(());
    }
    println!("レビュー対象: {}件\n", targets.len());

    let mut approved = 0usize;
    let mut rejected = 0usize;

    for filepath in &targets {
        let Some(record) = manager.record(filepath) else {
            continue;
        };
        println!("── {} (retry: {})", record.filepath, record.retry_cnt);
        println!("{}\n", record.prompt_en);

        let choice = Select::new()
            .with_prompt("このキャプションを確定しますか")
            .items(&["承認", "却下", "スキップ"])
            .default(0)
            .interact()
            .map_err(|e| TaggerError::Config(format!("対話入力エラー: {}", e)))?;

        match choice {
            0 => {
                manager.approve(filepath)?;
                approved += 1;
            }
            1 => {
                manager.reject(filepath)?;
                rejected += 1;
            }
            _ => {}
        }
        println!();
    }

    manager.save()?;
    println!("✅ レビュー完了: 承認 {} / 却下 {}", approved, rejected);
    Ok(())
}

/// 1レコードの再生成
async fn regenerate_caption(
    config: &Config,
    manifest_path: &Path,
    filepath: &str,
    prompt: String,
) -> Result<()> {
    println!("🔄 image-tagger - 再生成\n");

    config.validate()?;

    let mut manager = ManifestManager::load(manifest_path)?;
    manager.request_regeneration(filepath)?;

    let base_dir = manifest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let target = base_dir.join(filepath);

    let client: Arc<dyn VisionApi> = Arc::new(VisionClient::new(config)?);
    let request = TagRequest {
        prompt,
        system_prompt: Some(config.system_prompt.clone()),
    };
    let report = pipeline::run_pipeline(
        client,
        &[target],
        &request,
        &Base64SizeEstimator,
        &config.pipeline_config(),
        None,
        CancelFlag::new(),
    )
    .await;

    for result in &report.results {
        if result.success {
            manager.store_generated(filepath, &result.text);
            println!("✔ 新しいキャプションを保存しました（承認待ち）");
        } else {
            eprintln!("⚠️ 再生成に失敗しました: {}", result.text);
        }
    }
    for skip in &report.skipped {
        eprintln!("⚠️ スキップ: {} ({})", skip.path.display(), skip.reason);
    }

    manager.save()?;
    println!("\n✅ 完了");
    Ok(())
}

/// API設定の検証（1×1ピクセルのPNGで疎通確認する）
async fn check_config(config: &Config) -> Result<()> {
    println!("🔍 image-tagger - API設定の検証\n");

    config.validate()?;

    println!("📋 現在の設定:");
    println!("  API URL: {}", config.api_base_url);
    println!("  モデル: {}", config.model);
    println!("  APIキー: {}", mask_api_key(config.api_key.as_deref()));
    println!("  Group ID: {}", config.group_id.as_deref().unwrap_or("未設定"));
    println!("  並行数: {}", config.concurrency);
    println!("  リトライ回数: {}", config.retry_max);

    const TEST_PNG_BASE64: &str =
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChAGA7VT9mwAAAABJRU5ErkJggg==";
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(TEST_PNG_BASE64)
        .map_err(|e| TaggerError::Config(format!("テスト画像のデコードに失敗: {}", e)))?;
    let payload = ImagePayload {
        mime_type: "image/png".to_string(),
        bytes,
    };

    println!("\n🔄 API接続をテスト中...");
    let client = VisionClient::new(config)?;
    let reply = client
        .generate(
            "この画像を簡単に説明してください",
            &[payload],
            Some("画像の内容を簡潔に説明してください"),
        )
        .await?;

    let preview: String = reply.chars().take(100).collect();
    println!("✅ API接続テスト成功");
    println!("📝 応答: {}...", preview);
    Ok(())
}

/// APIキーの先頭と末尾だけを見せる
fn mask_api_key(key: Option<&str>) -> String {
    match key {
        None => "未設定".to_string(),
        Some(key) if key.chars().count() <= 14 => "***".to_string(),
        Some(key) => {
            let head: String = key.chars().take(10).collect();
            let tail: String = key
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("{}...{}", head, tail)
        }
    }
}
