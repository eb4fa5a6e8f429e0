//! Secret / credential store collaborator

use super::errors::CollaboratorResult;
use crate::topology::InstanceAddr;

/// Password vault client.
pub trait CredentialStore: Send + Sync {
    /// Fetch the password of `username` on an instance.
    fn get_password(&self, addr: &InstanceAddr, cloud_zone: u32, username: &str) -> CollaboratorResult<String>;

    /// Store the password of `username` on an instance.
    fn set_password(
        &self,
        addr: &InstanceAddr,
        cloud_zone: u32,
        username: &str,
        password: &str,
    ) -> CollaboratorResult<()>;

    /// Forget passwords of `usernames` on the given instances.
    fn delete_passwords(
        &self,
        cloud_zone: u32,
        instances: &[InstanceAddr],
        usernames: &[String],
    ) -> CollaboratorResult<()>;
}
