//! [`AssetResolver`] backed by the `yt-dlp` command-line tool.
//!
//! Every call spawns a fresh `yt-dlp` process. Processes are killed when the
//! calling future is dropped, which is how per-call timeouts and client
//! disconnects stop in-flight work.
//!
//! ffmpeg is a deployment requirement: audio extraction cannot work without
//! it and video formats cannot be merged. Its absence is detected once at
//! initialization; audio requests are then refused up front.

use std::{
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, sync::OnceCell};
use tracing::{debug, info, warn};

use super::AssetResolver;
use crate::error::ResolveError;
use crate::model::{AssetInfo, Quality};

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub binary: PathBuf,
    pub ffmpeg: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("yt-dlp"),
            ffmpeg: None,
            cookies: None,
        }
    }
}

/// Subset of `yt-dlp --dump-single-json`; only the title is used.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    fulltitle: Option<String>,
}

#[derive(Debug)]
struct Toolchain {
    version: String,
    ffmpeg: bool,
}

#[derive(Debug)]
pub struct YtDlpResolver {
    config: YtDlpConfig,
    toolchain: OnceCell<Toolchain>,
}

impl YtDlpResolver {
    pub fn new(config: YtDlpConfig) -> Self {
        Self {
            config,
            toolchain: OnceCell::new(),
        }
    }

    /// Verifies the toolchain once per process. Concurrent callers share a
    /// single check; later calls return the cached version.
    pub async fn initialize(&self) -> Result<&str, ResolveError> {
        Ok(self.toolchain().await?.version.as_str())
    }

    /// Whether ffmpeg answered the startup check.
    pub async fn ffmpeg_available(&self) -> Result<bool, ResolveError> {
        Ok(self.toolchain().await?.ffmpeg)
    }

    async fn toolchain(&self) -> Result<&Toolchain, ResolveError> {
        self.toolchain
            .get_or_try_init(|| async {
                let version = query_version(&self.config.binary).await?;
                info!(version = %version, binary = %self.config.binary.display(), "yt-dlp available");
                let ffmpeg = self.check_ffmpeg().await;
                Ok::<_, ResolveError>(Toolchain { version, ffmpeg })
            })
            .await
    }

    fn ffmpeg_path(&self) -> PathBuf {
        self.config
            .ffmpeg
            .clone()
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }

    async fn check_ffmpeg(&self) -> bool {
        let ffmpeg = self.ffmpeg_path();
        match query_version_with(&ffmpeg, "-version").await {
            Ok(_) => {
                debug!(ffmpeg = %ffmpeg.display(), "ffmpeg available");
                true
            }
            Err(err) => {
                warn!(
                    ffmpeg = %ffmpeg.display(),
                    error = %err,
                    "ffmpeg not usable; audio requests will be refused and video formats may not merge"
                );
                false
            }
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.binary);
        command
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-playlist")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cookies) = &self.config.cookies
            && cookies.exists()
        {
            command.arg("--cookies").arg(cookies);
        }
        if let Some(ffmpeg) = &self.config.ffmpeg {
            command.arg("--ffmpeg-location").arg(ffmpeg);
        }
        command
    }

    async fn run(&self, mut command: Command, source: &str) -> Result<Output, ResolveError> {
        command.arg("--").arg(source);
        let output = command.output().await.map_err(|source| ResolveError::Spawn {
            program: self.config.binary.display().to_string(),
            source,
        })?;
        if !output.status.success() {
            return Err(ResolveError::failed(output.status, &output.stderr));
        }
        Ok(output)
    }

    async fn download(
        &self,
        mut command: Command,
        source: &str,
        output: &Path,
    ) -> Result<(), ResolveError> {
        command
            .arg("--force-overwrites")
            .arg("--output")
            .arg(output_template(output));
        self.run(command, source).await?;

        if tokio::fs::metadata(output).await.is_err() {
            return Err(ResolveError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }
}

#[async_trait]
impl AssetResolver for YtDlpResolver {
    async fn info(&self, source: &str) -> Result<AssetInfo, ResolveError> {
        self.initialize().await?;
        let mut command = self.command();
        command.arg("--dump-single-json").arg("--skip-download");
        let output = self.run(command, source).await?;
        let info: VideoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(AssetInfo {
            title: info.fulltitle.or(info.title),
        })
    }

    async fn download_audio(
        &self,
        source: &str,
        format: &str,
        output: &Path,
    ) -> Result<(), ResolveError> {
        if !self.ffmpeg_available().await? {
            return Err(ResolveError::Unavailable(format!(
                "audio extraction needs ffmpeg, which was not found at {}",
                self.ffmpeg_path().display()
            )));
        }
        let mut command = self.command();
        command
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg(format)
            .arg("--audio-quality")
            .arg("0");
        self.download(command, source, output).await
    }

    async fn download_video(
        &self,
        source: &str,
        quality: Quality,
        output: &Path,
    ) -> Result<(), ResolveError> {
        self.initialize().await?;
        let mut command = self.command();
        command
            .arg("--format")
            .arg(quality.format_selector())
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--remux-video")
            .arg("mp4");
        self.download(command, source, output).await
    }
}

async fn query_version(binary: &Path) -> Result<String, ResolveError> {
    query_version_with(binary, "--version").await
}

/// Runs `<binary> <flag>` and returns the first line of stdout.
async fn query_version_with(binary: &Path, flag: &str) -> Result<String, ResolveError> {
    let output = Command::new(binary)
        .arg(flag)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ResolveError::Spawn {
            program: binary.display().to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(ResolveError::failed(output.status, &output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_owned())
}

/// yt-dlp picks the extension itself, so the template is the target path with
/// `%(ext)s` in place of the extension. Literal `%` must be doubled.
fn output_template(output: &Path) -> String {
    let stem = output.with_extension("");
    format!("{}.%(ext)s", stem.to_string_lossy().replace('%', "%%"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use futures::future::join_all;
    use std::{fs, sync::Arc};
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn install_script(path: &Path, script: &str) -> Result<()> {
        fs::write(path, script)?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }

    fn install_ffmpeg_stub(dir: &Path) -> Result<PathBuf> {
        let script_path = dir.join("ffmpeg");
        install_script(&script_path, "#!/usr/bin/env bash\necho \"ffmpeg version 6.1\"\n")?;
        Ok(script_path)
    }

    /// Every `--version` call appends a line to `version-calls` next to the
    /// script.
    fn install_ytdlp_stub(dir: &Path) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -euo pipefail
prev=""
output=""
audio=0
for arg in "$@"; do
    if [[ "$prev" == "--output" ]]; then
        output="$arg"
    fi
    if [[ "$arg" == "--extract-audio" ]]; then
        audio=1
    fi
    prev="$arg"
done
if [[ " $* " == *" --version "* ]]; then
    echo call >> "$(dirname "$0")/version-calls"
    sleep 0.2
    echo "2025.01.01"
    exit 0
fi
if [[ " $* " == *"broken"* ]]; then
    echo "ERROR: [generic] video unavailable" >&2
    exit 1
fi
if [[ " $* " == *" --dump-single-json "* ]]; then
cat <<'JSON'
{"id": "alpha", "title": "Alpha", "fulltitle": "Alpha: Full Title"}
JSON
exit 0
fi
if [[ " $* " == *"silent"* ]]; then
    exit 0
fi
ext="mp4"
if [[ $audio -eq 1 ]]; then
    ext="mp3"
fi
target=$(printf '%s' "$output" | sed "s/%(ext)s/$ext/")
printf 'media-bytes' > "$target"
"#;
        install_script(&script_path, script)?;
        Ok(script_path)
    }

    fn stub_resolver(dir: &Path) -> Result<YtDlpResolver> {
        let binary = install_ytdlp_stub(dir)?;
        let ffmpeg = install_ffmpeg_stub(dir)?;
        Ok(YtDlpResolver::new(YtDlpConfig {
            binary,
            ffmpeg: Some(ffmpeg),
            ..YtDlpConfig::default()
        }))
    }

    #[test]
    fn output_template_swaps_extension_and_escapes_percent() {
        assert_eq!(
            output_template(Path::new("/tmp/ws/Song One.mp3")),
            "/tmp/ws/Song One.%(ext)s"
        );
        assert_eq!(
            output_template(Path::new("/tmp/ws/100% Mr. Blue.mp4")),
            "/tmp/ws/100%% Mr. Blue.%(ext)s"
        );
    }

    #[tokio::test]
    async fn initialize_caches_version() -> Result<()> {
        let temp = tempdir()?;
        let resolver = stub_resolver(temp.path())?;
        assert_eq!(resolver.initialize().await?, "2025.01.01");
        assert_eq!(resolver.initialize().await?, "2025.01.01");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_checks_version_once() -> Result<()> {
        let temp = tempdir()?;
        let resolver = Arc::new(stub_resolver(temp.path())?);

        let callers = (0..8).map(|_| {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.initialize().await.map(str::to_owned) })
        });
        for version in join_all(callers).await {
            assert_eq!(version??, "2025.01.01");
        }
        assert!(resolver.ffmpeg_available().await?);

        let checks = fs::read_to_string(temp.path().join("version-calls"))?;
        assert_eq!(checks.lines().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn audio_is_refused_without_ffmpeg() -> Result<()> {
        let temp = tempdir()?;
        let resolver = YtDlpResolver::new(YtDlpConfig {
            binary: install_ytdlp_stub(temp.path())?,
            ffmpeg: Some(temp.path().join("missing-ffmpeg")),
            ..YtDlpConfig::default()
        });
        assert!(!resolver.ffmpeg_available().await?);

        let audio = temp.path().join("Alpha.mp3");
        let err = resolver
            .download_audio("https://example.com/a", "mp3", &audio)
            .await
            .expect_err("no ffmpeg");
        assert!(matches!(err, ResolveError::Unavailable(_)));
        assert!(!audio.exists());

        let video = temp.path().join("Alpha.mp4");
        resolver
            .download_video("https://example.com/a", Quality::Highest, &video)
            .await?;
        assert!(video.exists());
        Ok(())
    }

    #[tokio::test]
    async fn info_prefers_full_title() -> Result<()> {
        let temp = tempdir()?;
        let resolver = stub_resolver(temp.path())?;
        let info = resolver.info("https://example.com/watch?v=alpha").await?;
        assert_eq!(info.title.as_deref(), Some("Alpha: Full Title"));
        Ok(())
    }

    #[tokio::test]
    async fn info_reports_failures() -> Result<()> {
        let temp = tempdir()?;
        let resolver = stub_resolver(temp.path())?;
        let err = resolver
            .info("https://example.com/broken")
            .await
            .expect_err("broken source");
        assert!(matches!(err, ResolveError::Failed { .. }));
        assert!(err.to_string().contains("video unavailable"));
        Ok(())
    }

    #[tokio::test]
    async fn downloads_land_on_the_requested_path() -> Result<()> {
        let temp = tempdir()?;
        let resolver = stub_resolver(temp.path())?;
        let out_dir = temp.path().join("ws");
        fs::create_dir_all(&out_dir)?;

        let audio = out_dir.join("Alpha.mp3");
        resolver
            .download_audio("https://example.com/a", "mp3", &audio)
            .await?;
        assert_eq!(fs::read(&audio)?, b"media-bytes");

        let video = out_dir.join("Alpha.mp4");
        resolver
            .download_video("https://example.com/a", Quality::MaxHeight(720), &video)
            .await?;
        assert_eq!(fs::read(&video)?, b"media-bytes");
        Ok(())
    }

    #[tokio::test]
    async fn missing_output_is_an_error() -> Result<()> {
        let temp = tempdir()?;
        let resolver = stub_resolver(temp.path())?;
        let target = temp.path().join("never.mp4");
        let err = resolver
            .download_video("https://example.com/silent", Quality::Highest, &target)
            .await
            .expect_err("no file written");
        assert!(matches!(err, ResolveError::MissingOutput(_)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_binary_fails_initialization() {
        let resolver = YtDlpResolver::new(YtDlpConfig {
            binary: PathBuf::from("/nonexistent/yt-dlp"),
            ..YtDlpConfig::default()
        });
        let err = resolver.initialize().await.expect_err("missing binary");
        assert!(matches!(err, ResolveError::Spawn { .. }));
    }
}
