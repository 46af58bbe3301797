//!
//! Runs a model on one image and prints the strongest outputs
//!

#[macro_use]
extern crate log;

use std::{error::Error, path::PathBuf, process::ExitCode, time::Instant};

use clap::Parser;
use inference_helper::{config::Config, logger::Logger, ImageRegion, SourceFormat};

const TOP_K: usize = 5;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Engine configuration (TOML)
    config: PathBuf,

    /// Image fed to every image input
    image: PathBuf,

    /// Number of preprocess and invoke rounds
    #[arg(default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    iterations: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args.config, args.image, args.iterations) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: PathBuf, image: PathBuf, iterations: u64) -> Result<(), Box<dyn Error>> {
    let config = Config::load(&config)?;
    match &config.log_filter {
        Some(filter) => Logger::with_filter(filter),
        None => Logger::new(),
    }
    .init()?;

    let frame = image::open(&image)?.to_rgb8();
    let region = ImageRegion::full(frame.width() as usize, frame.height() as usize, 3);
    info!("loaded {} ({}x{})", image.display(), region.width, region.height);

    let mut inputs = config.input_descriptors(region);
    for input in &mut inputs {
        // Decoded images are always RGB
        if input.source.is_image() {
            input.source = SourceFormat::ImageRgb;
        }
    }
    let mut outputs = config.output_descriptors();

    let mut engine = inference_helper::create_with(config.backend, &config.engine_options())?;
    if let Some(num_threads) = config.num_threads {
        engine.set_num_threads(num_threads)?;
    }

    let start = Instant::now();
    engine.initialize(&config.model, &mut inputs, &mut outputs)?;
    info!("initialized {} backend in {:?}", engine.kind(), start.elapsed());

    let frames = vec![frame.as_raw().as_slice(); inputs.len()];
    for i in 0..iterations {
        let start = Instant::now();
        engine.preprocess(&inputs, &frames)?;
        let preprocessed = start.elapsed();
        engine.invoke(&mut outputs)?;
        debug!(
            "iteration {i}: preprocess {preprocessed:?}, total {:?}",
            start.elapsed()
        );
    }

    for output in &mut outputs {
        let name = output.tensor.name.clone();
        let shape = output.tensor.shape.clone();
        let values = output.float_view(engine.as_ref())?;

        let mut ranked: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        println!("{name} {shape:?}");
        for (index, value) in ranked.into_iter().take(TOP_K) {
            println!("  {index:>6}  {value:.6}");
        }
    }

    engine.finalize()?;

    Ok(())
}
