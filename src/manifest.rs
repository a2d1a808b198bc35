//! Manifestレコード管理
//!
//! 画像1枚につき1レコードをCSVで永続化する。filepath（相対パス）が
//! 一意キー。ステータスは承認ワークフローの状態機械に従ってのみ遷移し、
//! パイプライン層がステータスを直接書き換えることはない。
//! 生成直後のキャプションはprompt_enに保存したままpendingに留め、
//! 人手の承認（approve）で初めてapprovedになる。

use crate::error::{Result, TaggerError};
use crate::scanner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CSV_HEADERS: [&str; 5] = ["filepath", "prompt_en", "prompt_cn", "status", "retry_cnt"];

/// レコードの処理ステータス
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// 生成待ち・承認待ち（初期状態）
    #[default]
    Pending,
    /// 人手で承認済み
    Approved,
    /// 人手で却下
    Rejected,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Approved => "approved",
            ProcessStatus::Rejected => "rejected",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for ProcessStatus {
    type Err = TaggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProcessStatus::Pending),
            "approved" => Ok(ProcessStatus::Approved),
            "rejected" => Ok(ProcessStatus::Rejected),
            other => Err(TaggerError::InvalidStatus(other.to_string())),
        }
    }
}

/// 画像1枚分のレコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filepath: String,
    #[serde(default)]
    pub prompt_en: String,
    #[serde(default)]
    pub prompt_cn: String,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub retry_cnt: u32,
}

impl ImageRecord {
    pub fn new(filepath: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            prompt_en: String::new(),
            prompt_cn: String::new(),
            status: ProcessStatus::Pending,
            retry_cnt: 0,
        }
    }
}

/// Manifestファイルの管理
#[derive(Debug)]
pub struct ManifestManager {
    path: PathBuf,
    records: Vec<ImageRecord>,
}

impl ManifestManager {
    /// 空のmanifestを作成する（保存先のみ決める）
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            records: Vec::new(),
        }
    }

    /// CSVから読み込む。ファイルがなければ空のmanifestを返す
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                records: Vec::new(),
            });
        }

        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            let record: ImageRecord = row?;
            records.push(record);
        }

        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    /// CSVへ保存する。親ディレクトリがなければ作成する
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut writer = csv::Writer::from_path(&self.path)?;
        if self.records.is_empty() {
            // レコードが無くてもヘッダ行は常に書く
            writer.write_record(CSV_HEADERS)?;
        }
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, filepath: &str) -> Option<&ImageRecord> {
        self.records.iter().find(|r| r.filepath == filepath)
    }

    fn record_mut(&mut self, filepath: &str) -> Option<&mut ImageRecord> {
        self.records.iter_mut().find(|r| r.filepath == filepath)
    }

    /// 新規レコードを追加する。既存なら何もしない
    pub fn add_record(&mut self, filepath: &str) -> bool {
        if self.record(filepath).is_some() {
            return false;
        }
        self.records.push(ImageRecord::new(filepath));
        true
    }

    /// 生成されたキャプションを保存する
    ///
    /// ステータスは変更しない（承認待ちのまま保持する）。
    /// レコードが無ければ新規作成する。
    pub fn store_generated(&mut self, filepath: &str, prompt_en: &str) {
        if let Some(record) = self.record_mut(filepath) {
            record.prompt_en = prompt_en.to_string();
        } else {
            let mut record = ImageRecord::new(filepath);
            record.prompt_en = prompt_en.to_string();
            self.records.push(record);
        }
    }

    /// 承認する（pending → approved のみ許可）
    pub fn approve(&mut self, filepath: &str) -> Result<()> {
        let record = self
            .record_mut(filepath)
            .ok_or_else(|| TaggerError::RecordNotFound(filepath.to_string()))?;
        match record.status {
            ProcessStatus::Pending => {
                record.status = ProcessStatus::Approved;
                Ok(())
            }
            from => Err(TaggerError::InvalidStatusTransition {
                filepath: filepath.to_string(),
                from: from.to_string(),
                to: ProcessStatus::Approved.to_string(),
            }),
        }
    }

    /// 却下する（pending / approved → rejected）
    ///
    /// 保存済みのテキストは上書きされるまで保持される。
    pub fn reject(&mut self, filepath: &str) -> Result<()> {
        let record = self
            .record_mut(filepath)
            .ok_or_else(|| TaggerError::RecordNotFound(filepath.to_string()))?;
        match record.status {
            ProcessStatus::Pending | ProcessStatus::Approved => {
                record.status = ProcessStatus::Rejected;
                Ok(())
            }
            from => Err(TaggerError::InvalidStatusTransition {
                filepath: filepath.to_string(),
                from: from.to_string(),
                to: ProcessStatus::Rejected.to_string(),
            }),
        }
    }

    /// 再生成を要求する
    ///
    /// どのステータスからでも受け付け、retry_cntを加算して
    /// 承認待ち（pending）に戻す。retry_cntが減ることはない。
    pub fn request_regeneration(&mut self, filepath: &str) -> Result<()> {
        let record = self
            .record_mut(filepath)
            .ok_or_else(|| TaggerError::RecordNotFound(filepath.to_string()))?;
        record.retry_cnt += 1;
        record.status = ProcessStatus::Pending;
        Ok(())
    }

    pub fn pending_records(&self) -> Vec<&ImageRecord> {
        self.records
            .iter()
            .filter(|r| r.status == ProcessStatus::Pending)
            .collect()
    }

    pub fn approved_records(&self) -> Vec<&ImageRecord> {
        self.records
            .iter()
            .filter(|r| r.status == ProcessStatus::Approved)
            .collect()
    }

    /// ディレクトリから画像を取り込み、新規追加したレコード数を返す
    ///
    /// filepathはディレクトリからの相対パス（区切りは `/` に正規化）。
    pub fn import_from_directory(&mut self, directory: &Path) -> Result<usize> {
        let images = scanner::scan_directory(directory)?;
        let mut imported = 0usize;

        for image in images {
            let relative = image.strip_prefix(directory).unwrap_or(&image);
            let filepath = relative.to_string_lossy().replace('\\', "/");
            if self.add_record(&filepath) {
                imported += 1;
            }
        }

        Ok(imported)
    }

    /// 承認済みキャプションを同名の.txtとして書き出す（LoRA学習用）
    ///
    /// output_dir省略時は画像と同じ場所に書く。書き出した件数を返す。
    pub fn export_txt_files(&self, base_dir: &Path, output_dir: Option<&Path>) -> Result<usize> {
        let mut exported = 0usize;

        for record in self.approved_records() {
            if record.prompt_en.is_empty() {
                continue;
            }

            let txt_path = match output_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)?;
                    let stem = Path::new(&record.filepath)
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| record.filepath.clone());
                    dir.join(format!("{}.txt", stem))
                }
                None => base_dir.join(&record.filepath).with_extension("txt"),
            };

            std::fs::write(&txt_path, &record.prompt_en)?;
            exported += 1;
        }

        Ok(exported)
    }
}
