// Copyright 2021 rexc project contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Runs a compile command on a remote build server. If the given command is
// not a compile command, it is run locally instead.

#[macro_use]
extern crate log;

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rexc::config::Config;
use rexc::errors::*;
use rexc::execution::ExecutionContext;
use rexc::metrics::PublisherGuard;
use rexc::remote::{GrpcRemoteExecution, RemoteExecution};

const RC_OK: i32 = 0;
const RC_USAGE: i32 = 100;
const RC_EXEC_FAILURE: i32 = 101;
const RC_GRPC_ERROR: i32 = 102;
const RC_CANCELLED: i32 = 130;

// Variables can also be set in a rexc.conf file; there the REXC_ prefix is
// omitted.
const HELP: &str = "\
USAGE: rexc <command>

If the given command is a compile command, rexc runs it on a remote build
server speaking the Remote Execution API. Otherwise it runs locally.

A command sent to the remote must name its compiler by a relative or
absolute path, never a bare name.

Environment variables (omit the REXC_ prefix in a rexc.conf file):

REXC_SERVER                  URI of the execution server (e.g. http://localhost:8085)
REXC_CAS_SERVER              URI of the CAS (defaults to REXC_SERVER)
REXC_ACTION_CACHE_SERVER     URI of the Action Cache (defaults to the CAS)
REXC_INSTANCE                REAPI instance name
REXC_PROJECT_ROOT            top-level project directory; paths inside it are
                             rewritten relative (default: working directory)
REXC_NO_PATH_REWRITE         keep paths absolute (normalization still applies)
REXC_PREFIX_MAP              colon-separated from=to absolute prefix rewrites
REXC_FORCE_REMOTE            send non-compile commands to the server too
REXC_CACHE_ONLY              on a cache miss, build locally instead of remotely
REXC_CACHE_UPLOAD_LOCAL_BUILD
                             upload the results of cache-only local builds
REXC_CACHE_UPLOAD_FAILED_BUILD
                             also upload failing local results (default: true)
REXC_ACTION_UNCACHEABLE      mark the Action do_not_cache
REXC_SKIP_CACHE              re-run instead of looking up the Action Cache
REXC_DONT_SAVE_OUTPUT        do not write output files to disk
REXC_DEPS_GLOBAL_PATHS       include absolute (system) dependencies
REXC_DEPS_OVERRIDE           comma-separated dependency list (skip discovery)
REXC_DEPS_DIRECTORY_OVERRIDE directory to send instead of discovered deps
REXC_OUTPUT_FILES_OVERRIDE   comma-separated outputs to request
REXC_OUTPUT_DIRECTORIES_OVERRIDE
                             comma-separated output directories to request
REXC_DEPS_EXCLUDE_PATHS      comma-separated path prefixes to drop from inputs
REXC_DEPS_ENV_<var>          set <var> for the local dependency command
REXC_REMOTE_ENV_<var>        set <var> in the remote environment
REXC_REMOTE_PLATFORM_<key>   REAPI platform property for worker selection
REXC_ENV_TO_READ             comma-separated local variables to forward
REXC_PRESERVE_ENV            forward all non-rexc local variables
REXC_RETRY_LIMIT             retries for failed RPCs (default 0)
REXC_RETRY_DELAY             base retry delay in ms, grows exponentially (default 1000)
REXC_REQUEST_TIMEOUT         per-RPC deadline in seconds (default: none)
REXC_KEEPALIVE_TIME          gRPC keepalive period in seconds (default: none)
REXC_CAS_DIGEST_FUNCTION     digest function (SHA256, SHA384, SHA512, MD5)
REXC_WORKING_DIR_PREFIX      prefix for the remote working directory
REXC_MAX_THREADS             blob transfer fan-out (-1 = all cores, default 4)
REXC_REAPI_VERSION           Remote Execution API version (default 2.2)
REXC_NO_EXECUTE              only build the Action and log its digest
REXC_ENABLE_METRICS          collect and publish StatsD metrics
REXC_METRICS_FILE            append metrics to this file (default: stderr)
REXC_METRICS_UDP_SERVER      send metrics to host:port (excludes METRICS_FILE)
REXC_LOG_LEVEL               log verbosity (default: error)
REXC_LOG_DIRECTORY           write log output to files in this directory
REXC_VERBOSE                 shorthand for REXC_LOG_LEVEL=debug";

fn main() {
    let argv: Vec<String> = env::args().collect();

    if argv.len() <= 1 {
        eprintln!("USAGE: rexc <command>");
        eprintln!("(run \"rexc --help\" for details)");
        std::process::exit(RC_USAGE);
    }
    match argv[1].as_str() {
        "--help" | "-h" => {
            println!("{}", HELP);
            std::process::exit(RC_OK);
        }
        "--version" | "-v" => {
            println!("rexc version: {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(RC_OK);
        }
        arg if arg.starts_with('-') => {
            eprintln!("rexc: unrecognized option '{}'", arg);
            eprintln!("USAGE: rexc <command>");
            eprintln!("(run \"rexc --help\" for details)");
            std::process::exit(RC_USAGE);
        }
        _ => {}
    }

    std::process::exit(run(&argv[1..]));
}

fn run(command: &[String]) -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rexc: {:#}", e);
            return exit_code_for(&e);
        }
    };
    init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("rexc: failed to start runtime: {}", e);
            return RC_EXEC_FAILURE;
        }
    };

    // The whole process shares one cancellation token, set from SIGINT. The
    // handler body is only the atomic store.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut context = ExecutionContext::new(config, stop);
    let _publisher = PublisherGuard::new(context.config(), context.metrics());

    let result = runtime.block_on(context.execute(command, |config| {
        futures::future::ready(
            GrpcRemoteExecution::connect(config).map(|c| Arc::new(c) as Arc<dyn RemoteExecution>),
        )
    }));

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("rexc: error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("rexc: caused by: {}", cause);
            }
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(e: &Error) -> i32 {
    if let Some(rpc) = e.downcast_ref::<RpcError>() {
        if rpc.is_cancelled() {
            RC_CANCELLED
        } else {
            RC_GRPC_ERROR
        }
    } else if e.downcast_ref::<ConfigError>().is_some() || e.downcast_ref::<ParseError>().is_some()
    {
        RC_USAGE
    } else {
        RC_EXEC_FAILURE
    }
}

fn init_logging(config: &Config) {
    let filters = if config.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&filters);
    if let Some(dir) = &config.log_directory {
        match fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("rexc.log"))
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("rexc: cannot open log file: {}", e),
        }
    }
    let _ = builder.try_init();
}
