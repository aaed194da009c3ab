//! Prints the CustomResourceDefinitions as a multi-document YAML stream.

use crds::{Cluster, Machine, MachineTemplate};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    for crd in [Cluster::crd(), Machine::crd(), MachineTemplate::crd()] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
