/*!
Metaphora translates vector GIS datasets between formats, reconciling attribute
schemas, reprojecting coordinates and reshaping geometries along the way.
*/

#![warn(noop_method_call)]
#![warn(single_use_lifetimes)] // This caught a few places where I didn't need to specify lifetimes but did.
#![warn(unused_lifetimes)]
#![warn(trivial_numeric_casts)]
#![warn(unreachable_pub)]
#![warn(meta_variable_misuse)]
#![warn(unused_macro_rules)]
#![warn(unused_qualifications)]
#![warn(variant_size_differences)]

use clap::Parser;

pub(crate) mod errors;
pub(crate) mod commands;
pub(crate) mod progress;
pub(crate) mod gdal_fixes;
pub(crate) mod geometry;
pub(crate) mod layer_source;
pub(crate) mod split_list;
pub(crate) mod clip;
pub(crate) mod transform;
pub(crate) mod target_layer;
pub(crate) mod translate;
#[cfg(test)] mod test;

use commands::Metaphora;
use commands::Task;
use errors::ProgramError;
use progress::ConsoleProgressBar;

/**
Runs Metaphora with arbitrary arguments. The first item in the arguments will be ignored. All output will be printed to Stdout or Stderr.
*/
fn run<Arg, Args>(args: &mut Args) -> Result<(),ProgramError>
where
    Arg: Clone + Into<std::ffi::OsString>,
    Args: Iterator<Item = Arg>
{
    let mut progress = ConsoleProgressBar::new();
    let command = Metaphora::try_parse_from(args)?;
    command.run(&mut progress)?;
    Ok(())
}

fn main() -> std::process::ExitCode {
    let mut args = std::env::args();
    // A Result<(),Box<dyn Error>> return would format the error with debug instead
    // of display, and that's not a good error message.
    match run(&mut args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}",err);
            std::process::ExitCode::FAILURE
        }
    }
}
