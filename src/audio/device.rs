//! Audio device discovery and format selection

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use tracing::{debug, info};

use crate::error::{AudioError, Error, Result};

/// Resolve the capture device, by name or the system default
pub fn input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => {
            let devices = host
                .input_devices()
                .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;
            for device in devices {
                if device.name().map(|n| n == wanted).unwrap_or(false) {
                    info!("Using input device: {}", wanted);
                    return Ok(device);
                }
            }
            Err(Error::Audio(AudioError::DeviceNotFound(wanted.to_string())))
        }
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Audio(AudioError::DeviceNotFound("default input".to_string()))),
    }
}

/// Resolve the playback device, by name or the system default
///
/// On the receiving laptop this is normally the virtual cable input so the
/// stream shows up as a microphone for other applications.
pub fn output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => {
            let devices = host
                .output_devices()
                .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;
            for device in devices {
                if device.name().map(|n| n == wanted).unwrap_or(false) {
                    info!("Using output device: {}", wanted);
                    return Ok(device);
                }
            }
            Err(Error::Audio(AudioError::DeviceNotFound(wanted.to_string())))
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Audio(AudioError::DeviceNotFound("default output".to_string()))),
    }
}

/// Pick a capture configuration at exactly the requested rate
///
/// The pipeline never resamples, so a device that cannot run at the
/// configured rate is an error rather than a silent quality change.
pub fn input_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;

    let mut fallback = None;
    for range in ranges {
        if range.min_sample_rate().0 > sample_rate || range.max_sample_rate().0 < sample_rate {
            continue;
        }
        match range.sample_format() {
            SampleFormat::F32 => {
                let config = range.with_sample_rate(SampleRate(sample_rate)).config();
                debug!(
                    "Input config: {} Hz, {} ch, f32",
                    config.sample_rate.0, config.channels
                );
                return Ok((config, SampleFormat::F32));
            }
            SampleFormat::I16 if fallback.is_none() => {
                fallback = Some(range.with_sample_rate(SampleRate(sample_rate)).config());
            }
            _ => {}
        }
    }

    if let Some(config) = fallback {
        debug!(
            "Input config: {} Hz, {} ch, i16",
            config.sample_rate.0, config.channels
        );
        return Ok((config, SampleFormat::I16));
    }

    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    Err(Error::Audio(AudioError::UnsupportedFormat(format!(
        "{} cannot capture at {} Hz in f32 or i16",
        name, sample_rate
    ))))
}

/// Pick a playback configuration at exactly the requested rate
pub fn output_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;

    for range in ranges {
        if range.sample_format() != SampleFormat::F32 {
            continue;
        }
        if range.min_sample_rate().0 > sample_rate || range.max_sample_rate().0 < sample_rate {
            continue;
        }
        let config = range.with_sample_rate(SampleRate(sample_rate)).config();
        debug!(
            "Output config: {} Hz, {} ch, f32",
            config.sample_rate.0, config.channels
        );
        return Ok((config, SampleFormat::F32));
    }

    let name = device.name().unwrap_or_else(|_| "unknown".to_string());
    Err(Error::Audio(AudioError::UnsupportedFormat(format!(
        "{} cannot play at {} Hz in f32",
        name, sample_rate
    ))))
}

/// Print every capture and playback device to stdout
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();

    println!("Input devices:");
    let inputs = host
        .input_devices()
        .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;
    for device in inputs {
        if let Ok(name) = device.name() {
            println!("  {}", name);
        }
    }

    println!("Output devices:");
    let outputs = host
        .output_devices()
        .map_err(|e| Error::Audio(AudioError::StreamError(e.to_string())))?;
    for device in outputs {
        if let Ok(name) = device.name() {
            println!("  {}", name);
        }
    }

    Ok(())
}
