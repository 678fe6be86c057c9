//! Clip assembly through an external encoder process.
//!
//! Buffered frames are streamed as raw BGR24 bytes into a single ffmpeg
//! invocation (optionally muxing a live audio capture), with the container
//! parameters fixed at process start. After the encoder exits, the output
//! file is polled until its size stops changing - a partially-flushed clip
//! must never reach downstream consumers - and a thumbnail still is pulled
//! out of the finished clip in a second invocation.
//!
//! All failure modes (spawn, non-zero exit, stabilization timeout) carry
//! the encoder's captured diagnostics in a [`ClipAssemblyError`].

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::error::ClipAssemblyError;
use crate::frame::Frame;

/// Encoder stderr kept for diagnostics on failure.
const STDERR_TAIL_LINES: usize = 40;

#[derive(Clone, Debug)]
pub struct ClipConfig {
    pub output_dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Interval between output-size polls.
    pub stabilize_poll: Duration,
    /// Hard bound on the stabilization wait.
    pub stabilize_timeout: Duration,
    /// Offset into the clip for the thumbnail still.
    pub thumbnail_offset: Duration,
    pub ffmpeg_command: String,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("media/event_clips"),
            width: 320,
            height: 240,
            fps: 20,
            stabilize_poll: Duration::from_millis(250),
            stabilize_timeout: Duration::from_secs(15),
            thumbnail_offset: Duration::from_millis(500),
            ffmpeg_command: "ffmpeg".to_string(),
        }
    }
}

/// A finished clip. Terminal once persisted; never mutated afterwards.
#[derive(Clone, Debug)]
pub struct ClipArtifact {
    pub video_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub duration: Duration,
    pub created_at: DateTime<Local>,
}

/// Serializes buffered frames (plus live audio) into a container file.
pub struct ClipAssembler {
    config: ClipConfig,
}

impl ClipAssembler {
    pub fn new(config: ClipConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClipConfig {
        &self.config
    }

    /// Encode `frames` into a new clip, wait for the file to stabilize on
    /// disk, and derive a thumbnail.
    pub fn assemble(
        &self,
        frames: &[Frame],
        audio_device: Option<&str>,
    ) -> Result<ClipArtifact, ClipAssemblyError> {
        debug_assert!(!frames.is_empty());

        std::fs::create_dir_all(&self.config.output_dir)?;
        let created_at = Local::now();
        let stamp = crate::file_stamp(created_at);
        let video_path = self.config.output_dir.join(format!("event_{}.mp4", stamp));
        let thumbnail_path = self.config.output_dir.join(format!("event_{}.jpg", stamp));

        self.encode(frames, audio_device, &video_path)?;
        wait_for_stabilization(
            &video_path,
            self.config.stabilize_poll,
            self.config.stabilize_timeout,
        )?;
        self.extract_thumbnail(&video_path, &thumbnail_path)?;

        let duration =
            Duration::from_millis(frames.len() as u64 * 1000 / self.config.fps.max(1) as u64);
        Ok(ClipArtifact {
            video_path,
            thumbnail_path,
            duration,
            created_at,
        })
    }

    fn encoder_args(&self, audio_device: Option<&str>, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-video_size".into(),
            format!("{}x{}", self.config.width, self.config.height),
            "-framerate".into(),
            self.config.fps.to_string(),
            "-i".into(),
            "-".into(),
        ];

        if let Some(device) = audio_device {
            args.extend(["-f".into(), "alsa".into(), "-i".into(), device.to_string()]);
        }

        args.extend([
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);

        if audio_device.is_some() {
            args.extend(["-c:a".into(), "aac".into(), "-shortest".into()]);
        }

        args.extend([
            "-movflags".into(),
            "+faststart".into(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Spawn the encoder and stream raw frames into its stdin, in capture
    /// order. Stderr is drained on a separate thread so a chatty encoder
    /// can never deadlock against our writes.
    fn encode(
        &self,
        frames: &[Frame],
        audio_device: Option<&str>,
        output: &Path,
    ) -> Result<(), ClipAssemblyError> {
        let args = self.encoder_args(audio_device, output);
        let mut child = Command::new(&self.config.ffmpeg_command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ClipAssemblyError::Spawn {
                command: self.config.ffmpeg_command.clone(),
                source,
            })?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                let mut tail: Vec<String> = Vec::new();
                for line in reader.lines().map_while(|l| l.ok()) {
                    if tail.len() >= STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                tail
            })
        });

        let mut write_result = Ok(());
        if let Some(mut stdin) = child.stdin.take() {
            for frame in frames {
                if frame.width() != self.config.width || frame.height() != self.config.height {
                    log::warn!(
                        "skipping {}x{} frame in a {}x{} clip",
                        frame.width(),
                        frame.height(),
                        self.config.width,
                        self.config.height
                    );
                    continue;
                }
                if let Err(e) = stdin.write_all(frame.data()) {
                    // Encoder died mid-stream; its exit status tells the story.
                    write_result = Err(e);
                    break;
                }
            }
            // Dropping stdin closes the pipe and signals end-of-stream.
        }

        let status = child.wait()?;
        let stderr_tail = stderr_thread
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
            .join("\n");

        if !status.success() {
            return Err(ClipAssemblyError::Encoder {
                code: status.code(),
                stderr: stderr_tail,
            });
        }
        if let Err(e) = write_result {
            return Err(ClipAssemblyError::Encoder {
                code: status.code(),
                stderr: format!("frame write failed: {} / {}", e, stderr_tail),
            });
        }
        Ok(())
    }

    /// Pull a single still out of the finished clip.
    fn extract_thumbnail(&self, video: &Path, thumbnail: &Path) -> Result<(), ClipAssemblyError> {
        let offset = self.config.thumbnail_offset.as_secs_f64();
        let output = Command::new(&self.config.ffmpeg_command)
            .args([
                "-y",
                "-ss",
                &format!("{:.3}", offset),
                "-i",
                &video.to_string_lossy(),
                "-frames:v",
                "1",
                "-q:v",
                "4",
                &thumbnail.to_string_lossy(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| ClipAssemblyError::Spawn {
                command: self.config.ffmpeg_command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ClipAssemblyError::Encoder {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Poll the file size until two consecutive polls agree, bounded by
/// `timeout`. Guards against handing a partially-flushed file downstream.
fn wait_for_stabilization(
    path: &Path,
    poll: Duration,
    timeout: Duration,
) -> Result<(), ClipAssemblyError> {
    let start = Instant::now();
    let mut last_size: Option<u64> = None;

    loop {
        let size = std::fs::metadata(path)?.len();
        if last_size == Some(size) {
            return Ok(());
        }
        last_size = Some(size);

        if start.elapsed() >= timeout {
            return Err(ClipAssemblyError::Stabilization {
                path: path.to_path_buf(),
                timeout,
            });
        }
        thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crate::frame::solid_frame;

    fn test_config(dir: &Path) -> ClipConfig {
        ClipConfig {
            output_dir: dir.to_path_buf(),
            width: 32,
            height: 24,
            ..ClipConfig::default()
        }
    }

    #[test]
    fn encoder_args_describe_the_raw_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = ClipAssembler::new(test_config(dir.path()));
        let args = assembler.encoder_args(None, Path::new("/tmp/out.mp4"));

        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo"));
        assert!(joined.contains("-pix_fmt bgr24"));
        assert!(joined.contains("-video_size 32x24"));
        assert!(joined.contains("-framerate 20"));
        assert!(joined.contains("-i -"));
        assert!(joined.contains("-c:v libx264"));
        assert!(!joined.contains("alsa"));
        assert!(!joined.contains("-c:a"));
    }

    #[test]
    fn audio_device_adds_a_second_input() {
        let dir = tempfile::tempdir().unwrap();
        let assembler = ClipAssembler::new(test_config(dir.path()));
        let args = assembler.encoder_args(Some("hw:1,0"), Path::new("/tmp/out.mp4"));

        let joined = args.join(" ");
        assert!(joined.contains("-f alsa -i hw:1,0"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-shortest"));
    }

    #[test]
    fn stable_files_pass_the_stabilization_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"finished clip bytes").unwrap();

        wait_for_stabilization(&path, Duration::from_millis(10), Duration::from_secs(1))
            .expect("static file stabilizes");
    }

    #[test]
    fn growing_files_hit_the_stabilization_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"start").unwrap();

        let writing = Arc::new(AtomicBool::new(true));
        let writer_flag = writing.clone();
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .unwrap();
            while writer_flag.load(Ordering::SeqCst) {
                let _ = file.write_all(&[0u8; 64]);
                let _ = file.flush();
                thread::sleep(Duration::from_millis(1));
            }
        });

        let result = wait_for_stabilization(
            &path,
            Duration::from_millis(25),
            Duration::from_millis(150),
        );
        writing.store(false, Ordering::SeqCst);
        writer.join().unwrap();

        match result {
            Err(ClipAssemblyError::Stabilization { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(150));
            }
            other => panic!("expected stabilization timeout, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_encoder_binary_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClipConfig {
            ffmpeg_command: "/nonexistent/sentry-ffmpeg".to_string(),
            ..test_config(dir.path())
        };
        let assembler = ClipAssembler::new(config);
        let frames = vec![solid_frame(32, 24, [1, 2, 3])];

        match assembler.assemble(&frames, None) {
            Err(ClipAssemblyError::Spawn { command, .. }) => {
                assert_eq!(command, "/nonexistent/sentry-ffmpeg");
            }
            other => panic!("expected spawn error, got {:?}", other.err()),
        }
    }
}
