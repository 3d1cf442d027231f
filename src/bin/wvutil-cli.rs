// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2024-2026 ElmorLabs <info@elmorlabs.com>
//! Command-line companion for the WireView Pro II.

use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum, crate_description, crate_version};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use wvutil::codec::WireRecord;
use wvutil::dfu::DfuProgrammer;
use wvutil::enumerate::candidate_ports;
use wvutil::log_parser::parse_log;
use wvutil::protocol::{DeviceConfig, NvmCommand, ScreenCommand};
use wvutil::session::DeviceSession;
use wvutil::{elf, error};

#[derive(Parser)]
#[command(version, about = format!("{} v{}", crate_description!(), crate_version!()), arg_required_else_help(true))]
struct CliArguments
{
	#[arg(global = true, short = 'p', long = "port")]
	/// Use the given serial port instead of scanning for the device
	port: Option<String>,

	#[command(subcommand)]
	subcommand: Commands,
}

#[derive(Subcommand)]
enum Commands
{
	/// Print identity and firmware build information for the connected device
	Info,
	/// Poll sensor telemetry and print each sample
	Monitor(MonitorArguments),
	/// Read or write the device configuration blob
	Config(ConfigArguments),
	/// Issue a non-volatile memory command
	Nvm(NvmArguments),
	/// Issue a display command
	Screen(ScreenArguments),
	/// Clear latched fault bits
	ClearFaults(ClearFaultsArguments),
	/// Decode an on-board log dump
	Log(LogArguments),
	/// Flash new firmware over DFU (reboots a connected device into its bootloader first)
	Flash(FlashArguments),
	/// Reboot the device into its DFU bootloader and exit
	Detach,
}

#[derive(Args)]
struct MonitorArguments
{
	#[arg(short = 'i', long = "interval", default_value_t = 1000)]
	/// Polling interval in milliseconds (clamped to 100..=5000)
	interval_ms: u64,
	#[arg(short = 'n', long = "samples", default_value_t = 0)]
	/// Stop after this many samples (0 = run until interrupted)
	samples: u64,
}

#[derive(Args)]
struct ConfigArguments
{
	#[command(subcommand)]
	subcommand: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands
{
	/// Read the configuration blob to a file
	Read
	{
		file: PathBuf,
	},
	/// Write a configuration blob from a file
	Write
	{
		file: PathBuf,
	},
}

#[derive(Copy, Clone, ValueEnum)]
enum NvmAction
{
	/// Persist the active configuration
	Save,
	/// Reload the persisted configuration
	Load,
	/// Restore factory defaults
	Defaults,
}

#[derive(Args)]
struct NvmArguments
{
	#[arg(value_enum)]
	action: NvmAction,
}

#[derive(Copy, Clone, ValueEnum)]
enum ScreenAction
{
	Pause,
	Resume,
	Next,
	Prev,
}

#[derive(Args)]
struct ScreenArguments
{
	#[arg(value_enum)]
	action: ScreenAction,
}

#[derive(Args)]
struct ClearFaultsArguments
{
	#[arg(long = "status", default_value = "0xffff", value_parser = parse_mask)]
	/// Bitmask of fault status bits to clear
	status_mask: u16,
	#[arg(long = "log", default_value = "0xffff", value_parser = parse_mask)]
	/// Bitmask of fault log bits to clear
	log_mask: u16,
}

#[derive(Args)]
struct LogArguments
{
	/// A raw dump of the device's flash log region
	file: PathBuf,
}

#[derive(Args)]
struct FlashArguments
{
	/// Firmware image: ELF32 or flat binary
	firmware: PathBuf,
	#[arg(long = "dfu-only", default_value_t = false)]
	/// Skip the bootloader command and program a device already in DFU mode
	dfu_only: bool,
}

fn parse_mask(value: &str) -> Result<u16, String>
{
	let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"));
	match digits {
		Some(digits) => u16::from_str_radix(digits, 16),
		None => value.parse(),
	}
	.map_err(|e| format!("invalid mask {value:?}: {e}"))
}

/// Opens a session on the requested port, or the first candidate port that
/// completes the handshake.
fn open_session(port: &Option<String>) -> Result<DeviceSession>
{
	let candidates = match port {
		Some(port) => vec![port.clone()],
		None => candidate_ports(),
	};
	if candidates.is_empty() {
		return Err(eyre!("no WireView Pro II serial port found (is the device plugged in?)"));
	}

	let mut wrong_device_seen = false;
	for name in &candidates {
		let session = DeviceSession::new(name)?;
		match session.connect() {
			Ok(true) => return Ok(session),
			Ok(false) => {
				info!("device on {name} is not a WireView Pro II");
				wrong_device_seen = true;
			},
			Err(e) => warn!("could not connect on {name}: {e}"),
		}
	}

	if wrong_device_seen {
		return Err(error::Error::WrongDevice.into());
	}
	Err(eyre!("no WireView Pro II answered on {} candidate port(s)", candidates.len()))
}

fn info_command(port: &Option<String>) -> Result<()>
{
	let session = open_session(port)?;
	let identity = session
		.identity()
		.ok_or_else(|| eyre!("connected session has no identity"))?;

	println!("WireView Pro II");
	println!("  Hardware revision: {}", identity.hardware_revision);
	println!("  Firmware version:  {}", identity.firmware_version);
	println!("  Unique id:         {}", identity.unique_id);
	if let Some(build) = session.read_build_string()? {
		println!("  Firmware build:    {build}");
	}

	session.disconnect();
	Ok(())
}

fn monitor_command(port: &Option<String>, args: &MonitorArguments) -> Result<()>
{
	let session = open_session(port)?;
	session.set_poll_interval_ms(args.interval_ms);

	let (sender, receiver) = channel();
	let _subscription = session.subscribe_data(move |data| {
		let _ = sender.send(data.clone());
	});

	let mut seen = 0u64;
	while session.connected() {
		let Ok(data) = receiver.recv_timeout(Duration::from_secs(10)) else {
			warn!("no telemetry for 10 s, giving up");
			break;
		};

		println!(
			"in {:5.1} °C  out {:5.1} °C  V {:?}  A {:?}  PSU {} W  faults {:#06x}/{:#06x}",
			data.temp_in_c(),
			data.temp_out_c(),
			data.pin_voltage_v,
			data.pin_current_a,
			data.psu_capability_w,
			data.fault_status,
			data.fault_log,
		);

		seen += 1;
		if args.samples != 0 && seen >= args.samples {
			break;
		}
	}

	session.disconnect();
	Ok(())
}

fn config_command(port: &Option<String>, args: &ConfigArguments) -> Result<()>
{
	let session = open_session(port)?;
	let result = match &args.subcommand {
		ConfigCommands::Read {
			file,
		} => {
			let config = session
				.read_config()?
				.ok_or_else(|| eyre!("device did not return its configuration in time"))?;
			std::fs::write(file, config.encode())?;
			println!("wrote {} bytes to {}", DeviceConfig::SIZE, file.display());
			Ok(())
		},
		ConfigCommands::Write {
			file,
		} => {
			let bytes = std::fs::read(file)?;
			let config = DeviceConfig::decode(&bytes).map_err(error::Error::from)?;
			session.write_config(&config)?;
			println!("configuration written ({} bytes)", DeviceConfig::SIZE);
			Ok(())
		},
	};

	session.disconnect();
	result
}

fn nvm_command(port: &Option<String>, args: &NvmArguments) -> Result<()>
{
	let session = open_session(port)?;
	let command = match args.action {
		NvmAction::Save => NvmCommand::Save,
		NvmAction::Load => NvmCommand::Load,
		NvmAction::Defaults => NvmCommand::Defaults,
	};
	session.nvm_cmd(command)?;
	println!("NVM command sent");
	session.disconnect();
	Ok(())
}

fn screen_command(port: &Option<String>, args: &ScreenArguments) -> Result<()>
{
	let session = open_session(port)?;
	let command = match args.action {
		ScreenAction::Pause => ScreenCommand::PauseUpdates,
		ScreenAction::Resume => ScreenCommand::ResumeUpdates,
		ScreenAction::Next => ScreenCommand::NextPage,
		ScreenAction::Prev => ScreenCommand::PreviousPage,
	};
	session.screen_cmd(command)?;
	session.disconnect();
	Ok(())
}

fn clear_faults_command(port: &Option<String>, args: &ClearFaultsArguments) -> Result<()>
{
	let session = open_session(port)?;
	session.clear_faults(args.status_mask, args.log_mask)?;
	println!("cleared faults (status {:#06x}, log {:#06x})", args.status_mask, args.log_mask);
	session.disconnect();
	Ok(())
}

fn log_command(args: &LogArguments) -> Result<()>
{
	let bytes = std::fs::read(&args.file)?;
	let records = parse_log(&bytes);

	for record in &records {
		let data = record.to_device_data();
		println!(
			"{}  T {:?} °C  V {:?}  A {:?}  PSU {} W",
			record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
			data.temps_c,
			data.pin_voltage_v,
			data.pin_current_a,
			data.psu_capability_w,
		);
	}
	println!("{} record(s)", records.len());
	Ok(())
}

fn flash_command(port: &Option<String>, args: &FlashArguments) -> Result<()>
{
	let firmware = std::fs::read(&args.firmware)?;

	// Total payload differs from file size for ELF images.
	let total: usize = match elf::load_segments(&firmware)? {
		Some(segments) => segments.iter().map(|s| s.data.len()).sum(),
		None => firmware.len(),
	};

	if !args.dfu_only {
		match open_session(port) {
			Ok(session) => {
				println!("Rebooting device into its bootloader...");
				session.enter_bootloader();
			},
			Err(e) => info!("no serial-mode device ({e}); assuming DFU mode already"),
		}
	}

	let mut programmer = wait_for_dfu_device()?;

	// Default template: `{wide_bar} {pos}/{len}`.
	let progress_bar = ProgressBar::new(total as u64).with_style(
		ProgressStyle::default_bar()
			.template(" {percent:>3}% |{bar:50}| {bytes}/{total_bytes} [{binary_bytes_per_sec} {elapsed}]")?,
	);

	println!("Flashing...");
	let bar = progress_bar.clone();
	programmer.program(&firmware, move |written| bar.inc(written as u64))?;
	progress_bar.finish();

	println!("Flash complete! The device should now reboot into the new firmware.");
	Ok(())
}

/// The bootloader takes a moment to re-enumerate after CMD_BOOTLOADER; retry
/// opening it for a few seconds before giving up.
fn wait_for_dfu_device() -> Result<DfuProgrammer<wvutil::dfu::UsbDfuLink>>
{
	const REBOOT_TIMEOUT: Duration = Duration::from_secs(10);
	const RETRY_INTERVAL: Duration = Duration::from_millis(500);

	let start = Instant::now();
	loop {
		match DfuProgrammer::open() {
			Ok(programmer) => return Ok(programmer),
			Err(e) if start.elapsed() < REBOOT_TIMEOUT => {
				log::debug!("DFU device not ready yet: {e}");
				std::thread::sleep(RETRY_INTERVAL);
			},
			Err(e) => return Err(eyre!("no device in DFU mode appeared within {REBOOT_TIMEOUT:?}: {e}")),
		}
	}
}

fn detach_command(port: &Option<String>) -> Result<()>
{
	let session = open_session(port)?;
	println!("Rebooting device into its DFU bootloader...");
	session.enter_bootloader();
	Ok(())
}

fn main() -> Result<()>
{
	color_eyre::install()?;
	env_logger::Builder::new()
		.filter_level(log::LevelFilter::Warn)
		.parse_default_env()
		.init();

	let args = CliArguments::parse();
	match &args.subcommand {
		Commands::Info => info_command(&args.port),
		Commands::Monitor(monitor_args) => monitor_command(&args.port, monitor_args),
		Commands::Config(config_args) => config_command(&args.port, config_args),
		Commands::Nvm(nvm_args) => nvm_command(&args.port, nvm_args),
		Commands::Screen(screen_args) => screen_command(&args.port, screen_args),
		Commands::ClearFaults(clear_args) => clear_faults_command(&args.port, clear_args),
		Commands::Log(log_args) => log_command(log_args),
		Commands::Flash(flash_args) => flash_command(&args.port, flash_args),
		Commands::Detach => detach_command(&args.port),
	}
}
