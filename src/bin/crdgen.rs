//! # CRD Generator
//!
//! Prints the CustomResourceDefinition YAML for `Kibana`, `Logstash` and
//! `LogstashPipeline`, one document each.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/stack.yaml
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::core::CustomResourceExt;
use stack_operator::crd::{Kibana, Logstash, LogstashPipeline};

fn main() {
    let crds = [Kibana::crd(), Logstash::crd(), LogstashPipeline::crd()];

    println!("# This file is auto-generated by crdgen");
    println!("# DO NOT EDIT THIS FILE MANUALLY");
    println!("# Change the types under src/crd/ and regenerate");
    for crd in &crds {
        match serde_yaml::to_string(crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("Failed to serialize CRD to YAML: {e}");
                std::process::exit(1);
            }
        }
    }
}
