use crate::{
    cli::BuildArgs,
    run::{Run, RunOptions},
    Error,
};

pub async fn build(args: BuildArgs, verbose: bool) -> Result<i32, Error> {
    let search_path = super::search_path(args.path.clone())?;
    let options = RunOptions {
        tasks: args.tasks,
        packages: args.packages,
        cache_dir: args.cache_dir,
        skip_cache_write: args.skip_cache_write,
        no_cache: args.no_cache,
        concurrency: args.concurrency,
        verbose,
        bail: args.bail,
        graph_file: args.graph,
    };

    let run = Run::new(&search_path, options)?;
    let summary = run.run().await?;

    println!();
    println!("{}", summary.describe());
    if summary.time_saved_ms > 0 {
        println!("cache saved {}ms so far", summary.time_saved_ms);
    }
    Ok(summary.exit_code())
}
