//! Joins the objects referencing one server into a [`Snapshot`].
use kube::ResourceExt;

use crate::crd::{SvnGroup, SvnRepository, SvnUser};
use crate::svnconfig::{Group, Repository, RepositoryPermission, Snapshot, User};

/// Builds the snapshot for the given objects, which are expected to be in
/// snapshot order already and to reference the same server.
///
/// Permissions for repositories which are not part of `repositories` and
/// memberships in groups which are not part of `groups` are dropped.
pub fn build_snapshot(
    repositories: &[SvnRepository],
    groups: &[SvnGroup],
    users: &[SvnUser],
) -> Snapshot {
    Snapshot {
        repositories: repositories
            .iter()
            .map(|repository| {
                let name = repository.name_any();
                Repository {
                    permissions: permissions_of(&name, groups),
                    name,
                }
            })
            .collect(),
        groups: groups
            .iter()
            .map(|group| {
                let name = group.name_any();
                Group {
                    users: members_of(&name, users),
                    name,
                }
            })
            .collect(),
        users: users
            .iter()
            .map(|user| User {
                name: user.name_any(),
                encrypted_password: user.spec.encrypted_password.clone(),
            })
            .collect(),
    }
}

fn permissions_of(repository: &str, groups: &[SvnGroup]) -> Vec<RepositoryPermission> {
    groups
        .iter()
        .flat_map(|group| {
            group
                .spec
                .permissions
                .iter()
                .filter(move |permission| permission.repository == repository)
                .map(move |permission| RepositoryPermission {
                    group: group.name_any(),
                    permission: permission.permission,
                })
        })
        .collect()
}

fn members_of(group: &str, users: &[SvnUser]) -> Vec<String> {
    users
        .iter()
        .filter(|user| user.spec.groups.iter().any(|name| name == group))
        .map(ResourceExt::name_any)
        .collect()
}
