use std::io;
use std::path::{Path, PathBuf};

/// Directory under the release holding the produced archives
pub const TARBALLS_DIR: &str = "tarballs";

/// File names inside the release directory
pub const MANIFEST_FILE: &str = "clips.tsv";
pub const ERRORS_FILE: &str = "errors.json";
pub const UPLOAD_LEDGER_FILE: &str = "uploaded.json";
pub const STATS_FILE: &str = "stats.json";
pub const REPORTED_FILE: &str = "reported.tsv";

/// Local file layout of a release
///
/// ```text
/// <output_root>/<release>/
///     clips.tsv  errors.json  uploaded.json  stats.json
///     <locale>/clips/<prefix>_<locale>_<id>.<ext>
///     <locale>/reported.tsv  <locale>/{train,dev,test,...}.tsv
///     tarballs/<label>.tar.gz
/// ```
#[derive(Debug, Clone)]
pub struct ReleaseLayout {
    release_name: String,
    root: PathBuf,
    clip_prefix: String,
    clip_extension: String,
}

impl ReleaseLayout {
    pub fn new(
        output_root: impl AsRef<Path>,
        release_name: impl Into<String>,
        clip_prefix: impl Into<String>,
        clip_extension: impl Into<String>,
    ) -> Self {
        let release_name = release_name.into();
        Self {
            root: output_root.as_ref().join(&release_name),
            release_name,
            clip_prefix: clip_prefix.into(),
            clip_extension: clip_extension.into(),
        }
    }

    pub fn release_name(&self) -> &str {
        &self.release_name
    }

    /// The release directory itself
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locale_dir(&self, locale: &str) -> PathBuf {
        self.root.join(sanitize_path_component(locale))
    }

    pub fn clips_dir(&self, locale: &str) -> PathBuf {
        self.locale_dir(locale).join("clips")
    }

    /// Deterministic local file name of a clip: `<prefix>_<locale>_<id>.<ext>`
    pub fn clip_file_name(&self, locale: &str, id: i64) -> String {
        format!(
            "{prefix}_{locale}_{id}.{ext}",
            prefix = self.clip_prefix,
            locale = sanitize_path_component(locale),
            id = id,
            ext = self.clip_extension
        )
    }

    pub fn clip_path(&self, locale: &str, file_name: &str) -> PathBuf {
        self.clips_dir(locale).join(file_name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn errors_path(&self) -> PathBuf {
        self.root.join(ERRORS_FILE)
    }

    pub fn upload_ledger_path(&self) -> PathBuf {
        self.root.join(UPLOAD_LEDGER_FILE)
    }

    pub fn stats_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    pub fn tarballs_dir(&self) -> PathBuf {
        self.root.join(TARBALLS_DIR)
    }

    pub fn archive_path(&self, label: &str) -> PathBuf {
        self.tarballs_dir().join(format!("{label}.tar.gz"))
    }

    /// Remote key of an archive: `<release>/<label>.tar.gz`
    pub fn archive_key(&self, label: &str) -> String {
        format!("{}/{label}.tar.gz", self.release_name)
    }

    pub fn stats_key(&self) -> String {
        format!("{}/{STATS_FILE}", self.release_name)
    }

    /// Locale directories currently present, sorted by name
    pub async fn locale_dirs(&self) -> io::Result<Vec<String>> {
        let mut locales = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != TARBALLS_DIR {
                locales.push(name);
            }
        }

        locales.sort();
        Ok(locales)
    }
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
