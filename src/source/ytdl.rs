//! Media-site downloads through `yt-dlp`.

use super::{SourceAdapter, WorkerPool, guess_mime};
use crate::{error::TransferError, progress::ProgressSink, reference::Reference, task::Fetched};

use std::path::{Path, PathBuf};

use async_process::{Command, Stdio};
use async_trait::async_trait;
use futures::{
    AsyncBufReadExt, AsyncReadExt, StreamExt,
    io::BufReader,
};
use tokio::select;
use tokio_util::sync::CancellationToken;

/// Marker prefixing our machine-readable progress lines.
const PROGRESS_MARKER: &str = "[relay]";

/// Progress line emitted by yt-dlp for every update.
const PROGRESS_TEMPLATE: &str = "download:[relay] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s";

/// Output template used when the user did not pick a name.
const DEFAULT_OUTPUT: &str = "%(title).150B [%(id)s].%(ext)s";

/// Extensions of files yt-dlp leaves behind while working.
const PARTIAL_EXTENSIONS: [&str; 3] = ["part", "ytdl", "temp"];

/// Log prefixes of yt-dlp post-processors that run after the download.
const POST_PROCESSORS: [&str; 6] = [
    "[Merger]",
    "[Fixup",
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[EmbedThumbnail]",
];

/// Runs `yt-dlp` as a child process, one pool slot per download.
pub struct YtdlSource {
    program: String,
    /// Arguments placed before ours, e.g. `-m yt_dlp` for `python3 -m yt_dlp`.
    leading_args: Vec<String>,
    pool: WorkerPool,
}

impl YtdlSource {
    /// Create a new `YtdlSource` from a command line such as `yt-dlp` or `python3 -m yt_dlp`.
    pub fn new(command: &str, pool: WorkerPool) -> Self {
        let mut parts = command.split_whitespace().map(ToString::to_string);
        Self {
            program: parts.next().unwrap_or_else(|| "yt-dlp".to_string()),
            leading_args: parts.collect(),
            pool,
        }
    }
}

/// Parsed progress line: downloaded bytes and the best known total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tick {
    downloaded: u64,
    total: Option<u64>,
}

/// Parse one line printed with `PROGRESS_TEMPLATE`; `NA` fields are unknown.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_progress(line: &str) -> Option<Tick> {
    let mut fields = line.trim().strip_prefix(PROGRESS_MARKER)?.split_whitespace();
    let number = |field: Option<&str>| {
        field
            .and_then(|f| f.parse::<f64>().ok())
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u64)
    };

    let downloaded = number(fields.next())?;
    let exact = number(fields.next());
    let estimate = number(fields.next());

    Some(Tick {
        downloaded,
        total: exact.or(estimate).filter(|&t| t > 0),
    })
}

/// Folds per-file progress into one running total.
///
/// Merged formats are fetched one after another, each counting from zero.
#[derive(Debug, Default)]
struct Accumulator {
    /// Bytes of files already finished.
    base: u64,
    /// Last reading of the current file.
    last: Option<Tick>,
}

impl Accumulator {
    /// Feed a tick, returning the overall (downloaded, total).
    fn push(&mut self, tick: Tick) -> (u64, Option<u64>) {
        if let Some(last) = self.last
            && tick.downloaded < last.downloaded
        {
            self.base += last.total.unwrap_or(last.downloaded).max(last.downloaded);
        }
        self.last = Some(tick);
        (
            self.base + tick.downloaded,
            tick.total.map(|t| self.base + t),
        )
    }
}

/// Whether yt-dlp moved on to post-processing.
fn is_post_processing(line: &str) -> bool {
    let line = line.trim_start();
    POST_PROCESSORS.iter().any(|prefix| line.starts_with(prefix))
}

/// Output template for `reference`; explicit names keep their stem, yt-dlp picks the extension.
fn output_template(reference: &Reference) -> String {
    reference.output_name().map_or_else(
        || DEFAULT_OUTPUT.to_string(),
        |name| {
            let stem = Path::new(name)
                .file_stem()
                .map_or_else(|| name.to_string(), |s| s.to_string_lossy().into_owned());
            // a bare % would start a template field
            format!("{}.%(ext)s", stem.replace('%', "%%"))
        },
    )
}

/// Find the finished output in `dir`: the largest non-partial file.
async fn find_output(dir: &Path) -> Result<Option<(PathBuf, u64)>, std::io::Error> {
    let mut entries = async_fs::read_dir(dir).await?;
    let mut best: Option<(PathBuf, u64)> = None;

    while let Some(entry) = entries.next().await {
        let entry = entry?;
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PARTIAL_EXTENSIONS.contains(&e));
        let metadata = entry.metadata().await?;
        if is_partial || !metadata.is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(_, size)| metadata.len() > *size) {
            best = Some((path, metadata.len()));
        }
    }

    Ok(best)
}

#[async_trait]
impl SourceAdapter for YtdlSource {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch(
        &self,
        reference: &Reference,
        destination: &Path,
        progress: &ProgressSink,
        cancellation_token: &CancellationToken,
    ) -> Result<Fetched, TransferError> {
        let url = reference
            .link()
            .ok_or_else(|| TransferError::transfer("reference has no link"))?;

        let _permit = self.pool.acquire(progress, cancellation_token).await?;

        let output = output_template(reference);

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .args([
                "--newline",
                "--no-playlist",
                "--no-colors",
                "--restrict-filenames",
                "--progress-template",
                PROGRESS_TEMPLATE,
                "--paths",
            ])
            .arg(destination)
            .args(["--output", output.as_str(), "--", url.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransferError::transfer(format!("could not start {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::transfer("no stdout"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransferError::transfer("no stderr"))?;

        let read_progress = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut accumulator = Accumulator::default();
            // merging and remuxing print nothing until they finish
            let mut post_processing = None;
            while let Some(Ok(line)) = lines.next().await {
                if let Some(tick) = parse_progress(&line) {
                    let (downloaded, total) = accumulator.push(tick);
                    progress.report(downloaded, total);
                } else if post_processing.is_none() && is_post_processing(&line) {
                    tracing::debug!("yt-dlp post-processing: {}", line.trim());
                    post_processing = Some(progress.hold());
                }
            }
        };
        let read_errors = async {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        };
        let run = async {
            let ((), errors) = futures::join!(read_progress, read_errors);
            (child.status().await, errors)
        };

        // on cancellation the child is killed when dropped on return
        let (status, errors) = select! {
            biased;
            () = cancellation_token.cancelled() => return Err(TransferError::Cancelled),
            res = run => res,
        };

        let status =
            status.map_err(|e| TransferError::transfer(format!("yt-dlp did not finish: {e}")))?;
        if !status.success() {
            let reason = errors
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("yt-dlp failed")
                .trim()
                .to_string();
            return Err(TransferError::transfer(reason));
        }

        let Some((path, size)) = find_output(destination)
            .await
            .map_err(|e| TransferError::transfer(format!("could not read output dir: {e}")))?
        else {
            return Err(TransferError::transfer("yt-dlp produced no file"));
        };
        if size == 0 {
            return Err(TransferError::transfer("source returned no data"));
        }

        progress.finish(size, Some(size));

        Ok(Fetched {
            mime_type: guess_mime(&path),
            path,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_are_parsed() {
        assert_eq!(
            parse_progress("[relay] 1024 4096 NA"),
            Some(Tick {
                downloaded: 1024,
                total: Some(4096)
            })
        );
        assert_eq!(
            parse_progress("[relay] 10 NA 2000.5"),
            Some(Tick {
                downloaded: 10,
                total: Some(2000)
            })
        );
        assert_eq!(
            parse_progress("[relay] 10 NA NA"),
            Some(Tick {
                downloaded: 10,
                total: None
            })
        );
        assert_eq!(parse_progress("[download] Destination: x.mp4"), None);
        assert_eq!(parse_progress("[relay] NA NA NA"), None);
    }

    #[test]
    fn merged_formats_accumulate() {
        let mut acc = Accumulator::default();
        let tick = |downloaded, total| Tick { downloaded, total };
        assert_eq!(acc.push(tick(50, Some(100))), (50, Some(100)));
        assert_eq!(acc.push(tick(100, Some(100))), (100, Some(100)));
        // audio stream starts over
        assert_eq!(acc.push(tick(10, Some(40))), (110, Some(140)));
        assert_eq!(acc.push(tick(40, Some(40))), (140, Some(140)));
    }

    #[test]
    fn explicit_names_are_literal() {
        let classifier = crate::reference::Classifier::default();
        let named = classifier
            .classify(
                "https://www.youtube.com/watch?v=abc|100% (live).mkv",
                None,
                crate::reference::Workflow::MediaSite,
            )
            .unwrap();
        assert_eq!(output_template(&named), "100%% (live).%(ext)s");

        let unnamed = classifier
            .classify(
                "https://www.youtube.com/watch?v=abc",
                None,
                crate::reference::Workflow::MediaSite,
            )
            .unwrap();
        assert_eq!(output_template(&unnamed), DEFAULT_OUTPUT);
    }

    #[test]
    fn post_processing_is_recognised() {
        assert!(is_post_processing("[Merger] Merging formats into \"clip.mkv\""));
        assert!(is_post_processing("[FixupM3u8] Fixing MPEG-TS in MP4 container"));
        assert!(!is_post_processing("[relay] 10 20 NA"));
        assert!(!is_post_processing("[youtube] abc: Downloading webpage"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        use std::time::Duration;

        /// Write a shell script standing in for yt-dlp; returns the command line running it.
        fn fake_binary(dir: &Path, body: &str) -> String {
            let path = dir.join("fake-yt-dlp.sh");
            std::fs::write(&path, format!("{body}\n")).unwrap();
            format!("sh {}", path.display())
        }

        fn reference() -> Reference {
            crate::reference::Classifier::default()
                .classify(
                    "https://www.youtube.com/watch?v=abc",
                    None,
                    crate::reference::Workflow::MediaSite,
                )
                .unwrap()
        }

        #[tokio::test]
        async fn downloads_into_destination() {
            let bin_dir = tempfile::tempdir().unwrap();
            let out_dir = tempfile::tempdir().unwrap();
            // the destination follows --paths
            let binary = fake_binary(
                bin_dir.path(),
                r#"while [ "$1" != "--paths" ]; do shift; done
dir="$2"
echo "[relay] 3 6 NA"
echo "[relay] 6 6 NA"
printf 'abcdef' > "$dir/clip [abc].mp4"
touch "$dir/clip [abc].mp4.part"
exit 0"#,
            );

            let (sink, _rx) = ProgressSink::new(Duration::ZERO);
            let fetched = YtdlSource::new(&binary, WorkerPool::new(1))
                .fetch(&reference(), out_dir.path(), &sink, &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(fetched.file_name(), "clip [abc].mp4");
            assert_eq!(fetched.size, 6);
            assert_eq!(fetched.mime_type.as_deref(), Some("video/mp4"));
            assert_eq!(sink.latest().unwrap().transferred, 6);
        }

        #[tokio::test]
        async fn failures_report_stderr() {
            let bin_dir = tempfile::tempdir().unwrap();
            let out_dir = tempfile::tempdir().unwrap();
            let binary = fake_binary(
                bin_dir.path(),
                "echo 'ERROR: Unsupported URL: https://www.youtube.com/watch?v=abc' >&2\nexit 1",
            );

            let (sink, _rx) = ProgressSink::new(Duration::ZERO);
            let res = YtdlSource::new(&binary, WorkerPool::new(1))
                .fetch(&reference(), out_dir.path(), &sink, &CancellationToken::new())
                .await;

            match res {
                Err(TransferError::TransferFailed { reason }) => {
                    assert!(reason.starts_with("ERROR: Unsupported URL"), "{reason}");
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn cancellation_kills_the_process() {
            let bin_dir = tempfile::tempdir().unwrap();
            let out_dir = tempfile::tempdir().unwrap();
            let binary = fake_binary(bin_dir.path(), "sleep 30");

            let token = CancellationToken::new();
            let canceller = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                canceller.cancel();
            });

            let (sink, _rx) = ProgressSink::new(Duration::ZERO);
            let res = tokio::time::timeout(
                Duration::from_secs(10),
                YtdlSource::new(&binary, WorkerPool::new(1)).fetch(
                    &reference(),
                    out_dir.path(),
                    &sink,
                    &token,
                ),
            )
            .await
            .unwrap();
            assert_eq!(res, Err(TransferError::Cancelled));
        }
    }
}
