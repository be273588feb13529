//! Terminal live view for a Hamamatsu mini-spectrometer.
//!
//! Opens the selected device, acquires spectra in a loop and prints
//! per-frame statistics together with the wavelength of the peak pixel.
//! Runs against the simulated device unless built with
//! `--features tokuspec_hardware`.

use clap::Parser;
use daq_hamamatsu::error::PluginResult;
use daq_hamamatsu::hardware::minispectro::{MiniSpectro, ParameterPatch};

#[derive(Parser, Debug)]
#[command(name = "spectro_live", about = "Mini-spectrometer live view")]
struct Args {
    /// Device family selector (proto, tg, tg_cooled, tm, tg_ccd, tm_ccd,
    /// tg_raman1, tg_raman2).
    #[arg(long, default_value = "tm_ccd")]
    device: String,

    /// Number of spectra to acquire.
    #[arg(long, default_value_t = 100)]
    frames: u32,

    /// Integration time override, in microseconds.
    #[arg(long)]
    integration_us: Option<u32>,
}

fn main() -> PluginResult<()> {
    env_logger::init();
    let args = Args::parse();

    let mut spectro = MiniSpectro::open(&args.device)?;
    let unit = spectro.unit_information().clone();
    println!(
        "{} (sensor {}, serial {}), {} elements",
        unit.unit_id.trim(),
        unit.sensor_name.trim(),
        unit.serial_number.trim(),
        spectro.sensor_size()
    );

    if let Some(us) = args.integration_us {
        spectro.patch_parameters(ParameterPatch::default().integration_time_us(us))?;
    }
    let param = spectro.get_parameters()?;
    println!(
        "integration {} us, gain {}, trigger {} ({} edge)",
        param.integration_time_us,
        param.gain().as_str(),
        param.trigger_mode().as_str(),
        param.trigger_edge().as_str()
    );

    for frame in 0..args.frames {
        let spectrum = spectro.acquire()?;
        let (mut min, mut max, mut sum, mut peak) = (u16::MAX, 0u16, 0u64, 0usize);
        for (pixel, &count) in spectrum.counts.iter().enumerate() {
            min = min.min(count);
            if count > max {
                max = count;
                peak = pixel;
            }
            sum += count as u64;
        }
        let mean = sum as f64 / spectrum.counts.len().max(1) as f64;
        println!(
            "frame {:>4}: min {:>5} max {:>5} mean {:>8.1}  peak @ px {} ({:.2} nm)",
            frame, min, max, mean, peak, spectrum.wavelengths[peak]
        );
    }

    spectro.close()
}
