//! `info` command: print the resolved configuration.

use crate::config::ConfigFile;

pub fn execute(config: &ConfigFile) -> Result<(), String> {
    println!("Tilescape configuration");
    println!("=======================");
    match ConfigFile::default_path() {
        Some(path) => println!("Config file:        {}", path.display()),
        None => println!("Config file:        (no platform config directory)"),
    }
    println!();
    println!("[scheduler]");
    println!("max_concurrent      = {}", config.scheduler.max_concurrent);
    println!();
    println!("[refinement]");
    println!("sse_threshold       = {}", config.refinement.sse_threshold);
    println!("max_level           = {}", config.refinement.max_level);
    println!("retained_budget     = {}", config.refinement.retained_budget);
    println!();
    println!("[simulation]");
    println!("cycles              = {}", config.simulation.cycles);
    println!("frame_ms            = {}", config.simulation.frame_ms);
    println!(
        "viewport            = {}x{}",
        config.simulation.viewport_width, config.simulation.viewport_height
    );
    println!(
        "fetch_latency_ms    = {}",
        config.simulation.fetch_latency_ms
    );
    println!("fail_every          = {}", config.simulation.fail_every);
    Ok(())
}
