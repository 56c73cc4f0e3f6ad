//! Bootloader engine backed by an external `esptool` executable.
//!
//! esptool opens the serial port itself, so the client only borrows the
//! link's port name and makes sure the link is closed before each run.
//! Image bytes are staged into a temporary directory for `write_flash`.

use {
    flashpilot::{
        BootloaderClient, BootloaderFactory, DeviceIdentity, DeviceLink, Error, FlashImage,
        Result, WriteOptions, bootloader::WriteProgress, manifest::DeviceParams,
    },
    log::{debug, trace},
    std::{
        ffi::OsString,
        fs,
        io::{BufRead, BufReader, Read},
        path::PathBuf,
        process::{Command, ExitStatus, Stdio},
        thread,
    },
};

/// Executable used when neither `--esptool` nor `[engine] program` is set.
pub const DEFAULT_PROGRAM: &str = "esptool";

/// Creates esptool-backed clients.
#[derive(Debug, Clone)]
pub struct EsptoolEngine {
    program: String,
    args: Vec<String>,
}

impl EsptoolEngine {
    /// Engine running `program` with `args` placed before every command.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, port: &str, baud: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--port")
            .arg(port)
            .arg("--baud")
            .arg(baud.to_string());
        // Keep terminal Ctrl-C away from esptool; the CLI decides when to abort.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }

    /// Run `cmd`, feeding every stdout line to `on_line`. Returns the collected stdout.
    fn run(&self, mut cmd: Command, mut on_line: impl FnMut(&str)) -> Result<String> {
        debug!("Running {cmd:?}");
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Bootloader(format!("Failed to start {}: {e}", self.program)))?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut text = String::new();
                if let Err(e) = stderr.read_to_string(&mut text) {
                    debug!("Reading esptool stderr failed: {e}");
                }
                text
            })
        });

        let mut output = String::new();
        if let Some(stdout) = child.stdout.take() {
            if let Err(e) = self.stream_lines(stdout, &mut output, &mut on_line) {
                // The session fails here, so esptool must not keep writing
                if let Err(kill_err) = child.kill() {
                    trace!("Killing {} failed: {kill_err}", self.program);
                }
                if let Err(wait_err) = child.wait() {
                    trace!("Reaping {} failed: {wait_err}", self.program);
                }
                return Err(e.into());
            }
        }

        let status = child.wait()?;
        let errors = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(output)
        } else {
            Err(Error::Bootloader(failure_message(&output, &errors, status)))
        }
    }

    /// Split `stdout` on `\n` and `\r`, feeding non-empty lines to `on_line`.
    fn stream_lines(
        &self,
        stdout: impl Read,
        output: &mut String,
        on_line: &mut impl FnMut(&str),
    ) -> std::io::Result<()> {
        for chunk in BufReader::new(stdout).split(b'\n') {
            let chunk = chunk?;
            // Progress updates may be separated by carriage returns only
            for line in String::from_utf8_lossy(&chunk).split('\r') {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                trace!("{}: {line}", self.program);
                on_line(line);
                output.push_str(line);
                output.push('\n');
            }
        }
        Ok(())
    }
}

impl BootloaderFactory for EsptoolEngine {
    fn create(&self) -> Box<dyn BootloaderClient> {
        Box::new(EsptoolClient {
            engine: self.clone(),
            baud: 115_200,
        })
    }
}

/// One esptool session.
pub struct EsptoolClient {
    engine: EsptoolEngine,
    baud: u32,
}

impl EsptoolClient {
    fn release(link: &mut dyn DeviceLink) -> Result<String> {
        if link.is_open() {
            link.close()?;
        }
        Ok(link.name().to_string())
    }
}

impl BootloaderClient for EsptoolClient {
    fn connect(&mut self, link: &mut dyn DeviceLink, baud_rate: u32) -> Result<DeviceIdentity> {
        let port = Self::release(link)?;
        self.baud = baud_rate;

        let mut cmd = self.engine.command(&port, baud_rate);
        cmd.args(["--after", "no_reset", "chip_id"]);
        let output = self.engine.run(cmd, |_| {})?;

        parse_identity(&output)
            .ok_or_else(|| Error::Bootloader("esptool did not report a chip type".to_string()))
    }

    fn write_images(
        &mut self,
        link: &mut dyn DeviceLink,
        images: &[FlashImage],
        params: &DeviceParams,
        options: WriteOptions,
        progress: WriteProgress<'_>,
    ) -> Result<()> {
        let port = Self::release(link)?;

        let staging = tempfile::tempdir()?;
        let mut staged = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let path = staging
                .path()
                .join(format!("{index:02}-{}.bin", file_stem(&image.name)));
            fs::write(&path, &image.data)?;
            staged.push((image.address, path));
        }

        let mut cmd = self.engine.command(&port, self.baud);
        cmd.args(["--after", "no_reset"])
            .args(write_args(&staged, params, options));

        let mut tracker = WriteTracker::default();
        self.engine
            .run(cmd, |line| tracker.feed(line, &mut *progress))?;
        Ok(())
    }

    fn hard_reset(&mut self, link: &mut dyn DeviceLink) -> Result<()> {
        let port = Self::release(link)?;
        let mut cmd = self.engine.command(&port, self.baud);
        cmd.args(["--after", "hard_reset", "chip_id"]);
        self.engine.run(cmd, |_| {})?;
        Ok(())
    }

    fn disconnect(&mut self, link: &mut dyn DeviceLink) -> Result<()> {
        // esptool releases the port when each run exits
        Self::release(link).map(|_| ())
    }
}

/// Arguments of the `write_flash` command for staged `(address, path)` pairs.
fn write_args(
    staged: &[(u32, PathBuf)],
    params: &DeviceParams,
    options: WriteOptions,
) -> Vec<OsString> {
    let compression = if options.compress { "-z" } else { "-u" };
    let mut args: Vec<OsString> = vec!["write_flash".into(), compression.into()];
    if options.erase_all {
        args.push("--erase-all".into());
    }
    for (flag, value) in [
        ("--flash_mode", &params.flash_mode),
        ("--flash_freq", &params.flash_freq),
        ("--flash_size", &params.flash_size),
    ] {
        args.push(flag.into());
        args.push(value.into());
    }
    for (address, path) in staged {
        args.push(format!("0x{address:X}").into());
        args.push(path.into());
    }
    args
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Maps `Writing at 0x… (NN %)` and `Wrote …` lines to per-image progress.
#[derive(Debug, Default)]
struct WriteTracker {
    image: usize,
}

impl WriteTracker {
    fn feed(&mut self, line: &str, progress: &mut dyn FnMut(usize, usize, usize)) {
        if let Some(percent) = parse_write_percent(line) {
            progress(self.image, percent, 100);
        } else if line.starts_with("Wrote ") {
            progress(self.image, 100, 100);
            self.image += 1;
        }
    }
}

fn parse_write_percent(line: &str) -> Option<usize> {
    if !line.starts_with("Writing at 0x") {
        return None;
    }
    let open = line.rfind('(')?;
    let close = line[open..].find('%')? + open;
    line[open + 1..close].trim().parse().ok()
}

fn parse_identity(output: &str) -> Option<DeviceIdentity> {
    let mut chip = None;
    let mut id = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("Chip is ") {
            chip = Some(rest.split(" (").next().unwrap_or(rest).trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Chip type:") {
            chip.get_or_insert_with(|| rest.split(" (").next().unwrap_or(rest).trim().to_string());
        } else if let Some(rest) = line.strip_prefix("MAC:") {
            id = Some(rest.trim().to_string());
        }
    }
    chip.map(|chip| DeviceIdentity { chip, id })
}

fn failure_message(stdout: &str, stderr: &str, status: ExitStatus) -> String {
    const FATAL: &str = "A fatal error occurred: ";

    let fatal = stderr
        .lines()
        .chain(stdout.lines())
        .find_map(|l| l.trim().strip_prefix(FATAL));
    if let Some(message) = fatal {
        return message.trim_end_matches('.').to_string();
    }

    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map_or_else(|| format!("esptool exited with {status}"), str::to_string)
}
