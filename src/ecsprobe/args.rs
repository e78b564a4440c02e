//! Manage command line arguments here.
use clap::{App, Arg};

/// This structure holds the command line arguments.
#[derive(Debug, Default)]
pub struct CliOptions {
    pub config: String,
    pub domains_list: String,
    pub prefixes_list: Option<String>,
    pub output_basedir: String,
    pub mux: String,
    pub ignore_response_scope: bool,
}

impl CliOptions {
    pub fn options() -> CliOptions {
        let matches = App::new("Response Aware EDNS Client Subnet Scanner")
            .version("0.1")
            .about(
                r#"Probes authoritative nameservers with EDNS Client Subnet
options and adaptively enumerates the scopes they announce.
            "#,
            )
            .arg(
                Arg::new("config")
                    .long("config")
                    .required(true)
                    .long_help("Path to the YAML config file")
                    .takes_value(true),
            )
            .arg(
                Arg::new("domains_list")
                    .long("domains_list")
                    .required(true)
                    .long_help("File that contains the list of input domain names")
                    .takes_value(true),
            )
            .arg(
                Arg::new("prefixes_list")
                    .long("prefixes_list")
                    .required(false)
                    .long_help(
                        "File that contains the list of prefixes. If set the config file entries are ignored",
                    )
                    .takes_value(true),
            )
            .arg(
                Arg::new("output_basedir")
                    .long("output_basedir")
                    .required(true)
                    .long_help("Base directory for output data")
                    .takes_value(true),
            )
            .arg(
                Arg::new("mux")
                    .long("mux")
                    .required(true)
                    .long_help("The vantage point inventory to probe through")
                    .takes_value(true),
            )
            .arg(
                Arg::new("ignore-response-scope")
                    .long("ignore-response-scope")
                    .required(false)
                    .long_help(
                        "If set the scope prefix length of responses is ignored when scheduling measurements",
                    )
                    .takes_value(false),
            )
            .get_matches();

        // save all cli options into a structure
        let mut options = CliOptions::default();

        options.config = String::from(matches.value_of("config").unwrap());
        options.domains_list = String::from(matches.value_of("domains_list").unwrap());
        options.prefixes_list = matches.value_of("prefixes_list").map(String::from);
        options.output_basedir = String::from(matches.value_of("output_basedir").unwrap());
        options.mux = String::from(matches.value_of("mux").unwrap());
        options.ignore_response_scope = matches.is_present("ignore-response-scope");

        options
    }
}
