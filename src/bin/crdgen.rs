//! Prints the CustomResourceDefinitions of all kinds handled by the operator
//! as a multi-document YAML stream, ready for `kubectl apply -f -`.
use kube::CustomResourceExt;

use svn_operator::crd::{SvnGroup, SvnRepository, SvnServer, SvnUser};

fn main() -> anyhow::Result<()> {
    let crds = vec![
        SvnServer::crd(),
        SvnRepository::crd(),
        SvnGroup::crd(),
        SvnUser::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
