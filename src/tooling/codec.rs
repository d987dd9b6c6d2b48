use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    thread::JoinHandle,
};

use anyhow::{Context, Result, bail};
use tracing as log;

use crate::utils::hash::HashingFile;

/// Wire names for the supported compressors. `zstd` and `gzip` are native
/// (pack stack); `xz`, `bzip2` and `lzma` are sidecar subprocesses invoked
/// as `<codec> -c` / `<codec> -d -c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zstd,
    Xz,
    Gzip,
    Bzip2,
    Lzma,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fast,
    Balanced,
    Maximum,
    Ultra,
}

impl Codec {
    pub fn from_wire(s: &str) -> Result<Self> {
        Ok(match s {
            "zstd" => Codec::Zstd,
            "xz" => Codec::Xz,
            "gzip" => Codec::Gzip,
            "bzip2" => Codec::Bzip2,
            "lzma" => Codec::Lzma,
            "none" => Codec::None,
            // native zstd is always present, so auto never falls through
            "auto" => Codec::Zstd,
            other => bail!("unknown compression type: {other}"),
        })
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Codec::Zstd => "zstd",
            Codec::Xz => "xz",
            Codec::Gzip => "gzip",
            Codec::Bzip2 => "bzip2",
            Codec::Lzma => "lzma",
            Codec::None => "none",
        }
    }

    /// Archive extension including the tar prefix.
    pub fn archive_ext(self) -> &'static str {
        match self {
            Codec::Zstd => "tar.zst",
            Codec::Xz => "tar.xz",
            Codec::Gzip => "tar.gz",
            Codec::Bzip2 => "tar.bz2",
            Codec::Lzma => "tar.lzma",
            Codec::None => "tar",
        }
    }

    pub fn from_archive_name(name: &str) -> Self {
        let base = name.strip_suffix(".age").unwrap_or(name);
        if base.ends_with(".tar.zst") {
            Codec::Zstd
        } else if base.ends_with(".tar.xz") {
            Codec::Xz
        } else if base.ends_with(".tar.gz") {
            Codec::Gzip
        } else if base.ends_with(".tar.bz2") {
            Codec::Bzip2
        } else if base.ends_with(".tar.lzma") {
            Codec::Lzma
        } else {
            Codec::None
        }
    }

    /// Sidecar binary, when the codec is not handled natively.
    pub fn sidecar_bin(self) -> Option<&'static str> {
        match self {
            Codec::Xz => Some("xz"),
            Codec::Bzip2 => Some("bzip2"),
            Codec::Lzma => Some("lzma"),
            _ => None,
        }
    }
}

impl Mode {
    pub fn from_wire(s: &str) -> Result<Self> {
        Ok(match s {
            "fast" => Mode::Fast,
            "balanced" => Mode::Balanced,
            "maximum" => Mode::Maximum,
            "ultra" => Mode::Ultra,
            other => bail!("unknown compression mode: {other}"),
        })
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Balanced => "balanced",
            Mode::Maximum => "maximum",
            Mode::Ultra => "ultra",
        }
    }
}

/// Effective 1..9 level after the mode adjustment.
pub fn effective_level(level: u32, mode: Mode) -> u32 {
    let level = level.clamp(1, 9);
    match mode {
        Mode::Fast => level.saturating_sub(2).max(1),
        Mode::Balanced => level,
        Mode::Maximum => (level + 2).min(9),
        Mode::Ultra => 9,
    }
}

/// Map the 1..9 scale onto zstd's practical 1..19 range.
fn zstd_level(level: u32) -> i32 {
    const TABLE: [i32; 9] = [1, 3, 5, 7, 9, 12, 15, 17, 19];
    TABLE[(level.clamp(1, 9) - 1) as usize]
}

fn worker_threads(threads: u32) -> u32 {
    if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
    } else {
        threads
    }
}

/// Write side of the archive pipeline: tar bytes in, compressed+hashed
/// file out. `finish` flushes the codec and hands back the hashing sink.
pub trait ArchiveSink: Write + Send {
    fn finish(self: Box<Self>) -> Result<HashingFile>;
}

pub fn open_sink(
    codec: Codec,
    level: u32,
    threads: u32,
    tmp_path: &Path,
) -> Result<Box<dyn ArchiveSink>> {
    let sink = HashingFile::create(tmp_path)?;
    match codec {
        Codec::None => Ok(Box::new(PlainSink(sink))),
        Codec::Zstd => {
            let mut enc = zstd::stream::write::Encoder::new(sink, zstd_level(level))
                .context("init zstd encoder")?;
            let workers = worker_threads(threads);
            if workers > 1 {
                enc.multithread(workers).context("zstd multithread")?;
            }
            Ok(Box::new(ZstdSink(enc)))
        }
        Codec::Gzip => {
            if threads > 1 {
                log::debug!("gzip has no threading, ignoring threads={threads}");
            }
            let enc = flate2::write::GzEncoder::new(
                sink,
                flate2::Compression::new(level.clamp(1, 9)),
            );
            Ok(Box::new(GzipSink(enc)))
        }
        Codec::Xz | Codec::Bzip2 | Codec::Lzma => {
            let bin = codec.sidecar_bin().unwrap_or(codec.wire_name());
            let mut args = vec!["-c".to_string(), format!("-{}", level.clamp(1, 9))];
            if codec == Codec::Xz {
                args.push(format!("-T{}", worker_threads(threads)));
            } else if threads > 1 {
                log::debug!("{bin} has no threading, ignoring threads={threads}");
            }
            SidecarSink::spawn(bin, &args, sink).map(|s| Box::new(s) as Box<dyn ArchiveSink>)
        }
    }
}

struct PlainSink(HashingFile);

impl Write for PlainSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl ArchiveSink for PlainSink {
    fn finish(self: Box<Self>) -> Result<HashingFile> {
        Ok(self.0)
    }
}

struct ZstdSink(zstd::stream::write::Encoder<'static, HashingFile>);

impl Write for ZstdSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl ArchiveSink for ZstdSink {
    fn finish(self: Box<Self>) -> Result<HashingFile> {
        self.0.finish().context("finish zstd stream")
    }
}

struct GzipSink(flate2::write::GzEncoder<HashingFile>);

impl Write for GzipSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl ArchiveSink for GzipSink {
    fn finish(self: Box<Self>) -> Result<HashingFile> {
        self.0.finish().context("finish gzip stream")
    }
}

/// Pipes tar bytes through an external compressor. A drain thread copies
/// the child's stdout into the hashing sink so the pipeline stays a single
/// pass.
struct SidecarSink {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    drain: Option<JoinHandle<io::Result<HashingFile>>>,
}

impl SidecarSink {
    fn spawn(bin: &str, args: &[String], sink: HashingFile) -> Result<Self> {
        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn compressor {bin}"))?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .context("compressor stdout not piped")?;

        let drain = std::thread::spawn(move || -> io::Result<HashingFile> {
            let mut sink = sink;
            io::copy(&mut stdout, &mut sink)?;
            Ok(sink)
        });

        Ok(Self {
            label: format!("{bin} {}", args.join(" ")),
            child,
            stdin,
            drain: Some(drain),
        })
    }
}

impl Write for SidecarSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::other("compressor stdin already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl ArchiveSink for SidecarSink {
    fn finish(mut self: Box<Self>) -> Result<HashingFile> {
        drop(self.stdin.take()); // EOF to the compressor

        let sink = match self.drain.take() {
            Some(t) => t
                .join()
                .map_err(|_| anyhow::anyhow!("compressor drain thread panicked"))?
                .with_context(|| format!("drain {}", self.label))?,
            None => bail!("compressor already finished"),
        };

        let status = self
            .child
            .wait()
            .with_context(|| format!("wait for {}", self.label))?;
        if !status.success() {
            bail!("compressor failed: {} with {status}", self.label);
        }
        Ok(sink)
    }
}

impl Drop for SidecarSink {
    fn drop(&mut self) {
        if self.drain.is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Read side: decompressing stream over a finished archive, used by verify
/// inside bundles, the restore engine and the standalone decrypt flow.
pub fn open_source(codec: Codec, path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    match codec {
        Codec::None => Ok(Box::new(file)),
        Codec::Zstd => Ok(Box::new(
            zstd::stream::read::Decoder::new(file).context("init zstd decoder")?,
        )),
        Codec::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(file))),
        Codec::Xz | Codec::Bzip2 | Codec::Lzma => {
            let bin = codec.sidecar_bin().unwrap_or(codec.wire_name());
            SidecarSource::spawn(bin, file).map(|s| Box::new(s) as Box<dyn Read + Send>)
        }
    }
}

/// `<codec> -d -c` with the archive on stdin.
struct SidecarSource {
    child: Child,
    stdout: Option<std::process::ChildStdout>,
    label: String,
}

impl SidecarSource {
    fn spawn(bin: &str, input: File) -> Result<Self> {
        let mut child = Command::new(bin)
            .args(["-d", "-c"])
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn decompressor {bin}"))?;
        let stdout = child.stdout.take();
        Ok(Self {
            child,
            stdout,
            label: format!("{bin} -d -c"),
        })
    }
}

impl Read for SidecarSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.stdout.as_mut() {
            Some(r) => r.read(buf)?,
            None => 0,
        };
        if n == 0 && self.stdout.is_some() {
            self.stdout = None;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} failed with {status}",
                    self.label
                )));
            }
        }
        Ok(n)
    }
}

impl Drop for SidecarSource {
    fn drop(&mut self) {
        if self.stdout.is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
