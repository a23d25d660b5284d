use std::path::PathBuf;

use lorecon::utils::parse_triplet;

#[derive(clap::Parser, Debug, Clone)]
#[clap(name = "lorecon", about = "Iterative PET image reconstruction")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// Maximum number of rayon threads
    #[clap(short = 'j', long)]
    pub num_threads: Option<usize>,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {

    /// Reconstruct an image from measured data
    Reconstruct {
        /// TOML configuration file
        config: PathBuf,

        /// Raw f32 sinogram if the configuration has a [sinogram] table,
        /// binary event list otherwise
        #[clap(short, long)]
        input: PathBuf,

        /// Images are written to `<OUT>_<iteration>.raw`
        #[clap(short, long, default_value = "out/lorecon")]
        out: PathBuf,

        /// Validate the configuration and the input files, then stop
        #[clap(long)]
        check: bool,
    },

    /// Write the sinogram of a point source, with Poisson noise
    Simulate {
        /// TOML configuration file, which must have a [sinogram] table
        config: PathBuf,

        /// Raw f32 sinogram output file
        #[clap(short, long)]
        out: PathBuf,

        /// Position of the source in mm
        #[clap(short, long, value_parser = parse_triplet::<f32>, default_value = "0,0,0")]
        position: (f32, f32, f32),

        /// Activity of the source
        #[clap(short, long, default_value = "1000")]
        activity: f32,

        /// Seed of the Poisson noise. Noiseless if not given
        #[clap(short, long)]
        seed: Option<u64>,
    },
}
