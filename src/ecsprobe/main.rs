//! Response-aware EDNS Client Subnet scanner: resolves the authoritative
//! nameserver for every input domain, then explores how each authoritative
//! answers for different client subnets.
use std::process;

use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use ecslib::config::Config;
use ecslib::controller::Controller;
use ecslib::probe::{ProbeExecutor, UdpProbeExecutor};
use ecslib::resolver::AuthNsResolver;

mod args;
use args::CliOptions;

// BSD sysexits, matching the exit convention of the surrounding tooling
const EX_SOFTWARE: i32 = 70;
const EX_CONFIG: i32 = 78;

fn main() {
    // manage arguments from command line
    let options = CliOptions::options();

    env_logger::init();
    debug!("options: {:?}", &options);

    let config = match Config::load(
        &options.config,
        &options.domains_list,
        options.prefixes_list.as_deref(),
        options.ignore_response_scope,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(EX_CONFIG);
        }
    };

    let mut executor = match UdpProbeExecutor::open(&options.mux) {
        Ok(executor) => executor,
        Err(e) => {
            error!("{}", e);
            process::exit(EX_CONFIG);
        }
    };
    if let Err(e) = executor.add_vantage_points(config.vantage_points()) {
        error!("{}", e);
        process::exit(EX_CONFIG);
    }
    info!("using {} vantage point(s)", executor.num_vps());

    // authoritative NS resolution pre-phase
    let resolver_addr = match executor.resolver() {
        Some(addr) => addr.to_string(),
        None => {
            error!("config error: no resolver configured in the mux inventory");
            process::exit(EX_CONFIG);
        }
    };
    let resolver = match AuthNsResolver::new(&resolver_addr) {
        Ok(resolver) => resolver,
        Err(e) => {
            error!("{}", e);
            process::exit(EX_CONFIG);
        }
    };
    let resolved = match resolver.resolve_authoritative_nameservers(config.domains()) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("{}", e);
            process::exit(EX_SOFTWARE);
        }
    };
    info!("resolved {} (domain, nameserver) pair(s)", resolved.len());

    let rng = Box::new(StdRng::from_entropy());
    let mut controller = match Controller::new(
        &config,
        Box::new(executor),
        &resolved,
        &options.output_basedir,
        rng,
    ) {
        Ok(controller) => controller,
        Err(e) => {
            error!("{}", e);
            process::exit(EX_SOFTWARE);
        }
    };

    if let Err(e) = controller.start() {
        error!("{}", e);
        process::exit(1);
    }
    info!("scan complete");
}
