//! Tenancy: organizations, users, memberships, workspaces, invites.
//!
//! Workspace bootstrap creates the backing organization, the workspace and a
//! default environment in one transaction; the caller becomes owner. When
//! the last workspace of an organization is deleted the organization goes
//! with it.

use chrono::{Duration, Utc};
use redb::ReadableTable;

use stardag_types::{
    CreateWorkspaceRequest, InviteStatus, MemberResponse, Role, UpdateWorkspaceRequest,
    validate_slug,
};

use crate::db;
use crate::error::RegistryError;

use super::rows::{
    EnvironmentRow, InviteRow, MembershipRow, OrganizationRow, UserRow, WorkspaceRow,
};
use super::{decode, encode, new_id, Store};

pub const DEFAULT_ORG_ID: &str = "00000000-0000-0000-0000-000000000001";
pub const DEFAULT_USER_ID: &str = "00000000-0000-0000-0000-000000000002";
pub const DEFAULT_WORKSPACE_ID: &str = "00000000-0000-0000-0000-000000000003";
pub const DEFAULT_ENVIRONMENT_ID: &str = "00000000-0000-0000-0000-000000000004";

const INVITE_TTL_DAYS: i64 = 7;

impl Store {
    /// Seed the default organization, user, membership, workspace and
    /// environment so local development works without registration.
    pub fn ensure_seed(&self) -> Result<(), RegistryError> {
        {
            let txn = self.db().begin_read()?;
            let orgs = txn.open_table(db::ORGANIZATIONS)?;
            if orgs.get(DEFAULT_ORG_ID)?.is_some() {
                return Ok(());
            }
        }

        let txn = self.db().begin_write()?;
        {
            let mut orgs = txn.open_table(db::ORGANIZATIONS)?;
            let now = Utc::now();
            let org = OrganizationRow {
                id: DEFAULT_ORG_ID.to_string(),
                name: "Default".to_string(),
                slug: "default".to_string(),
                description: Some("Seeded default organization".to_string()),
                created_at: now,
            };
            orgs.insert(DEFAULT_ORG_ID, encode(&org)?.as_slice())?;

            let mut org_slugs = txn.open_table(db::ORG_SLUGS)?;
            org_slugs.insert("default", DEFAULT_ORG_ID)?;

            let user = UserRow {
                id: DEFAULT_USER_ID.to_string(),
                external_id: None,
                email: "dev@localhost".to_string(),
                display_name: Some("Local Developer".to_string()),
                created_at: now,
            };
            let mut users = txn.open_table(db::USERS)?;
            users.insert(DEFAULT_USER_ID, encode(&user)?.as_slice())?;
            let mut users_by_email = txn.open_table(db::USERS_BY_EMAIL)?;
            users_by_email.insert("dev@localhost", DEFAULT_USER_ID)?;

            let membership = MembershipRow {
                organization_id: DEFAULT_ORG_ID.to_string(),
                user_id: DEFAULT_USER_ID.to_string(),
                role: Role::Owner,
                created_at: now,
            };
            let mut memberships = txn.open_table(db::MEMBERSHIPS)?;
            memberships.insert(
                db::key2(DEFAULT_ORG_ID, DEFAULT_USER_ID).as_str(),
                encode(&membership)?.as_slice(),
            )?;

            let workspace = WorkspaceRow {
                id: DEFAULT_WORKSPACE_ID.to_string(),
                organization_id: DEFAULT_ORG_ID.to_string(),
                slug: "default".to_string(),
                name: "Default".to_string(),
                description: None,
                created_at: now,
            };
            let mut workspaces = txn.open_table(db::WORKSPACES)?;
            workspaces.insert(DEFAULT_WORKSPACE_ID, encode(&workspace)?.as_slice())?;
            let mut workspace_slugs = txn.open_table(db::WORKSPACE_SLUGS)?;
            workspace_slugs.insert(
                db::key2(DEFAULT_ORG_ID, "default").as_str(),
                DEFAULT_WORKSPACE_ID,
            )?;

            let environment = EnvironmentRow {
                id: DEFAULT_ENVIRONMENT_ID.to_string(),
                workspace_id: DEFAULT_WORKSPACE_ID.to_string(),
                slug: "default".to_string(),
                name: "Default".to_string(),
                description: None,
                owner_user_id: None,
                max_concurrent_locks: None,
                created_at: now,
            };
            let mut environments = txn.open_table(db::ENVIRONMENTS)?;
            environments.insert(DEFAULT_ENVIRONMENT_ID, encode(&environment)?.as_slice())?;
            let mut environment_slugs = txn.open_table(db::ENVIRONMENT_SLUGS)?;
            environment_slugs.insert(
                db::key2(DEFAULT_WORKSPACE_ID, "default").as_str(),
                DEFAULT_ENVIRONMENT_ID,
            )?;
        }
        txn.commit()?;
        log::info!("seeded default workspace {DEFAULT_WORKSPACE_ID} / environment {DEFAULT_ENVIRONMENT_ID}");
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<UserRow, RegistryError> {
        let txn = self.db().begin_read()?;
        let users = txn.open_table(db::USERS)?;
        let guard = users
            .get(user_id)?
            .ok_or_else(|| RegistryError::NotFound("user".to_string()))?;
        decode(guard.value())
    }

    /// Find-or-create keyed on the OIDC subject. The email claim is required
    /// and refreshed when it changes at the issuer.
    pub fn get_or_create_oidc_user(
        &self,
        external_id: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<UserRow, RegistryError> {
        let txn = self.db().begin_write()?;
        let user = {
            let mut users = txn.open_table(db::USERS)?;
            let mut users_by_external = txn.open_table(db::USERS_BY_EXTERNAL)?;
            let mut users_by_email = txn.open_table(db::USERS_BY_EMAIL)?;

            let existing_id = users_by_external
                .get(external_id)?
                .map(|g| g.value().to_string());

            match existing_id {
                Some(id) => {
                    let mut user: UserRow = {
                        let guard = users
                            .get(id.as_str())?
                            .ok_or_else(|| RegistryError::Internal("user index dangling".into()))?;
                        decode(guard.value())?
                    };
                    if user.email != email {
                        users_by_email.remove(user.email.as_str())?;
                        users_by_email.insert(email, id.as_str())?;
                        user.email = email.to_string();
                        users.insert(id.as_str(), encode(&user)?.as_slice())?;
                    }
                    user
                }
                None => {
                    let user = UserRow {
                        id: new_id(),
                        external_id: Some(external_id.to_string()),
                        email: email.to_string(),
                        display_name: display_name.map(str::to_string),
                        created_at: Utc::now(),
                    };
                    users.insert(user.id.as_str(), encode(&user)?.as_slice())?;
                    users_by_external.insert(external_id, user.id.as_str())?;
                    users_by_email.insert(email, user.id.as_str())?;
                    user
                }
            }
        };
        txn.commit()?;
        Ok(user)
    }

    pub fn role_in_org(&self, org_id: &str, user_id: &str) -> Result<Option<Role>, RegistryError> {
        let txn = self.db().begin_read()?;
        let memberships = txn.open_table(db::MEMBERSHIPS)?;
        let key = db::key2(org_id, user_id);
        let result = match memberships.get(key.as_str())? {
            Some(guard) => {
                let row: MembershipRow = decode(guard.value())?;
                Ok(Some(row.role))
            }
            None => Ok(None),
        };
        result
    }

    pub fn get_workspace(&self, workspace_id: &str) -> Result<WorkspaceRow, RegistryError> {
        let txn = self.db().begin_read()?;
        let workspaces = txn.open_table(db::WORKSPACES)?;
        let guard = workspaces
            .get(workspace_id)?
            .ok_or_else(|| RegistryError::NotFound("workspace".to_string()))?;
        decode(guard.value())
    }

    /// Resolve the caller's role in the organization owning a workspace.
    pub fn role_in_workspace(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<(WorkspaceRow, Option<Role>), RegistryError> {
        let workspace = self.get_workspace(workspace_id)?;
        let role = self.role_in_org(&workspace.organization_id, user_id)?;
        Ok((workspace, role))
    }

    pub fn workspaces_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<(WorkspaceRow, Role)>, RegistryError> {
        let txn = self.db().begin_read()?;
        let memberships = txn.open_table(db::MEMBERSHIPS)?;
        let workspaces = txn.open_table(db::WORKSPACES)?;

        let mut org_roles = Vec::new();
        for item in memberships.iter()? {
            let (_, value) = item?;
            let row: MembershipRow = decode(value.value())?;
            if row.user_id == user_id {
                org_roles.push((row.organization_id, row.role));
            }
        }

        let mut out = Vec::new();
        for item in workspaces.iter()? {
            let (_, value) = item?;
            let workspace: WorkspaceRow = decode(value.value())?;
            if let Some((_, role)) = org_roles
                .iter()
                .find(|(org, _)| *org == workspace.organization_id)
            {
                out.push((workspace, *role));
            }
        }
        out.sort_by(|a, b| a.0.slug.cmp(&b.0.slug));
        Ok(out)
    }

    /// Bootstrap a workspace: organization + workspace + default environment
    /// + owner membership, atomically.
    pub fn create_workspace(
        &self,
        user: &UserRow,
        req: &CreateWorkspaceRequest,
        max_per_user: usize,
    ) -> Result<WorkspaceRow, RegistryError> {
        validate_slug(&req.slug).map_err(|e| RegistryError::Validation(e.to_string()))?;

        let owned = self
            .workspaces_for_user(&user.id)?
            .into_iter()
            .filter(|(_, role)| *role == Role::Owner)
            .count();
        if owned >= max_per_user {
            return Err(RegistryError::Forbidden(format!(
                "workspace creation limit reached ({max_per_user})"
            )));
        }

        let now = Utc::now();
        let txn = self.db().begin_write()?;
        let workspace = {
            let mut org_slugs = txn.open_table(db::ORG_SLUGS)?;
            if org_slugs.get(req.slug.as_str())?.is_some() {
                return Err(RegistryError::Conflict(format!(
                    "slug '{}' is already taken",
                    req.slug
                )));
            }

            let org = OrganizationRow {
                id: new_id(),
                name: req.name.clone(),
                slug: req.slug.clone(),
                description: req.description.clone(),
                created_at: now,
            };
            let mut orgs = txn.open_table(db::ORGANIZATIONS)?;
            orgs.insert(org.id.as_str(), encode(&org)?.as_slice())?;
            org_slugs.insert(req.slug.as_str(), org.id.as_str())?;

            let membership = MembershipRow {
                organization_id: org.id.clone(),
                user_id: user.id.clone(),
                role: Role::Owner,
                created_at: now,
            };
            let mut memberships = txn.open_table(db::MEMBERSHIPS)?;
            memberships.insert(
                db::key2(&org.id, &user.id).as_str(),
                encode(&membership)?.as_slice(),
            )?;

            let workspace = WorkspaceRow {
                id: new_id(),
                organization_id: org.id.clone(),
                slug: req.slug.clone(),
                name: req.name.clone(),
                description: req.description.clone(),
                created_at: now,
            };
            let mut workspaces = txn.open_table(db::WORKSPACES)?;
            workspaces.insert(workspace.id.as_str(), encode(&workspace)?.as_slice())?;
            let mut workspace_slugs = txn.open_table(db::WORKSPACE_SLUGS)?;
            workspace_slugs.insert(
                db::key2(&org.id, &req.slug).as_str(),
                workspace.id.as_str(),
            )?;

            let environment = EnvironmentRow {
                id: new_id(),
                workspace_id: workspace.id.clone(),
                slug: "default".to_string(),
                name: "Default".to_string(),
                description: None,
                owner_user_id: None,
                max_concurrent_locks: None,
                created_at: now,
            };
            let mut environments = txn.open_table(db::ENVIRONMENTS)?;
            environments.insert(environment.id.as_str(), encode(&environment)?.as_slice())?;
            let mut environment_slugs = txn.open_table(db::ENVIRONMENT_SLUGS)?;
            environment_slugs.insert(
                db::key2(&workspace.id, "default").as_str(),
                environment.id.as_str(),
            )?;

            workspace
        };
        txn.commit()?;
        Ok(workspace)
    }

    pub fn update_workspace(
        &self,
        workspace_id: &str,
        req: &UpdateWorkspaceRequest,
    ) -> Result<WorkspaceRow, RegistryError> {
        let txn = self.db().begin_write()?;
        let workspace = {
            let mut workspaces = txn.open_table(db::WORKSPACES)?;
            let mut workspace: WorkspaceRow = {
                let guard = workspaces
                    .get(workspace_id)?
                    .ok_or_else(|| RegistryError::NotFound("workspace".to_string()))?;
                decode(guard.value())?
            };
            if let Some(name) = &req.name {
                workspace.name = name.clone();
            }
            if let Some(description) = &req.description {
                workspace.description = Some(description.clone());
            }
            workspaces.insert(workspace_id, encode(&workspace)?.as_slice())?;
            workspace
        };
        txn.commit()?;
        Ok(workspace)
    }

    /// Delete a workspace and everything scoped under it. If this was the
    /// organization's last workspace, the organization (with memberships and
    /// invites) is removed too, mirroring bootstrap.
    pub fn delete_workspace(&self, workspace_id: &str) -> Result<(), RegistryError> {
        let txn = self.db().begin_write()?;
        {
            let mut workspaces = txn.open_table(db::WORKSPACES)?;
            let workspace: WorkspaceRow = {
                let guard = workspaces
                    .get(workspace_id)?
                    .ok_or_else(|| RegistryError::NotFound("workspace".to_string()))?;
                decode(guard.value())?
            };

            // Environments under this workspace, then their scoped data.
            let mut environments = txn.open_table(db::ENVIRONMENTS)?;
            let env_ids: Vec<String> = {
                let mut ids = Vec::new();
                for item in environments.iter()? {
                    let (key, value) = item?;
                    let env: EnvironmentRow = decode(value.value())?;
                    if env.workspace_id == workspace_id {
                        ids.push(key.value().to_string());
                    }
                }
                ids
            };

            let mut environment_slugs = txn.open_table(db::ENVIRONMENT_SLUGS)?;
            for env_id in &env_ids {
                let env: EnvironmentRow = {
                    let guard = environments.get(env_id.as_str())?.ok_or_else(|| {
                        RegistryError::Internal("environment listing dangling".into())
                    })?;
                    decode(guard.value())?
                };
                environment_slugs.remove(db::key2(workspace_id, &env.slug).as_str())?;
                environments.remove(env_id.as_str())?;
                self.delete_environment_scoped_data(&txn, env_id)?;
            }

            let mut workspace_slugs = txn.open_table(db::WORKSPACE_SLUGS)?;
            workspace_slugs
                .remove(db::key2(&workspace.organization_id, &workspace.slug).as_str())?;
            workspaces.remove(workspace_id)?;

            // Drop the organization when no workspace remains.
            let org_has_workspaces = {
                let mut found = false;
                for item in workspaces.iter()? {
                    let (_, value) = item?;
                    let other: WorkspaceRow = decode(value.value())?;
                    if other.organization_id == workspace.organization_id {
                        found = true;
                        break;
                    }
                }
                found
            };
            if !org_has_workspaces {
                let mut orgs = txn.open_table(db::ORGANIZATIONS)?;
                if let Some(guard) = orgs.remove(workspace.organization_id.as_str())? {
                    let org: OrganizationRow = decode(guard.value())?;
                    let mut org_slugs = txn.open_table(db::ORG_SLUGS)?;
                    org_slugs.remove(org.slug.as_str())?;
                }

                let mut memberships = txn.open_table(db::MEMBERSHIPS)?;
                let (start, end) = db::prefix_range(&workspace.organization_id);
                let member_keys: Vec<String> = memberships
                    .range(start.as_str()..end.as_str())?
                    .map(|item| item.map(|(k, _)| k.value().to_string()))
                    .collect::<Result<_, _>>()?;
                for key in member_keys {
                    memberships.remove(key.as_str())?;
                }

                let mut invites = txn.open_table(db::INVITES)?;
                let invite_ids: Vec<(String, String)> = {
                    let mut ids = Vec::new();
                    for item in invites.iter()? {
                        let (key, value) = item?;
                        let invite: InviteRow = decode(value.value())?;
                        if invite.organization_id == workspace.organization_id {
                            ids.push((key.value().to_string(), invite.email));
                        }
                    }
                    ids
                };
                let mut pending = txn.open_table(db::PENDING_INVITES)?;
                for (id, email) in invite_ids {
                    invites.remove(id.as_str())?;
                    pending.remove(db::key2(&workspace.organization_id, &email).as_str())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list_members(&self, org_id: &str) -> Result<Vec<MemberResponse>, RegistryError> {
        let txn = self.db().begin_read()?;
        let memberships = txn.open_table(db::MEMBERSHIPS)?;
        let users = txn.open_table(db::USERS)?;

        let (start, end) = db::prefix_range(org_id);
        let mut out = Vec::new();
        for item in memberships.range(start.as_str()..end.as_str())? {
            let (_, value) = item?;
            let membership: MembershipRow = decode(value.value())?;
            let user: UserRow = match users.get(membership.user_id.as_str())? {
                Some(guard) => decode(guard.value())?,
                None => continue,
            };
            out.push(MemberResponse {
                user_id: user.id,
                email: user.email,
                display_name: user.display_name,
                role: membership.role,
            });
        }
        Ok(out)
    }

    pub fn update_member_role(
        &self,
        org_id: &str,
        target_user_id: &str,
        role: Role,
    ) -> Result<(), RegistryError> {
        let txn = self.db().begin_write()?;
        {
            let mut memberships = txn.open_table(db::MEMBERSHIPS)?;
            let key = db::key2(org_id, target_user_id);
            let mut membership: MembershipRow = {
                let guard = memberships
                    .get(key.as_str())?
                    .ok_or_else(|| RegistryError::NotFound("membership".to_string()))?;
                decode(guard.value())?
            };

            if membership.role == Role::Owner && role != Role::Owner {
                let owners = count_owners(&memberships, org_id)?;
                if owners <= 1 {
                    return Err(RegistryError::Validation(
                        "cannot demote the organization's only owner".to_string(),
                    ));
                }
            }

            membership.role = role;
            memberships.insert(key.as_str(), encode(&membership)?.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn remove_member(&self, org_id: &str, target_user_id: &str) -> Result<(), RegistryError> {
        let txn = self.db().begin_write()?;
        {
            let mut memberships = txn.open_table(db::MEMBERSHIPS)?;
            let key = db::key2(org_id, target_user_id);
            let membership: MembershipRow = {
                let guard = memberships
                    .get(key.as_str())?
                    .ok_or_else(|| RegistryError::NotFound("membership".to_string()))?;
                decode(guard.value())?
            };

            if membership.role == Role::Owner {
                let owners = count_owners(&memberships, org_id)?;
                if owners <= 1 {
                    return Err(RegistryError::Validation(
                        "cannot remove the organization's only owner".to_string(),
                    ));
                }
            }

            memberships.remove(key.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn create_invite(
        &self,
        org_id: &str,
        email: &str,
        role: Role,
        invited_by: &str,
    ) -> Result<InviteRow, RegistryError> {
        let now = Utc::now();
        let txn = self.db().begin_write()?;
        let invite = {
            let mut pending = txn.open_table(db::PENDING_INVITES)?;
            let pending_key = db::key2(org_id, email);
            if pending.get(pending_key.as_str())?.is_some() {
                return Err(RegistryError::Conflict(format!(
                    "a pending invite for {email} already exists"
                )));
            }

            let invite = InviteRow {
                id: new_id(),
                organization_id: org_id.to_string(),
                email: email.to_string(),
                role,
                status: InviteStatus::Pending,
                invited_by: invited_by.to_string(),
                expires_at: now + Duration::days(INVITE_TTL_DAYS),
                created_at: now,
            };
            let mut invites = txn.open_table(db::INVITES)?;
            invites.insert(invite.id.as_str(), encode(&invite)?.as_slice())?;
            pending.insert(pending_key.as_str(), invite.id.as_str())?;
            invite
        };
        txn.commit()?;
        Ok(invite)
    }

    pub fn list_invites(&self, org_id: &str) -> Result<Vec<InviteRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let invites = txn.open_table(db::INVITES)?;
        let mut out = Vec::new();
        for item in invites.iter()? {
            let (_, value) = item?;
            let invite: InviteRow = decode(value.value())?;
            if invite.organization_id == org_id {
                out.push(invite);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub fn pending_invites_for_email(&self, email: &str) -> Result<Vec<InviteRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let invites = txn.open_table(db::INVITES)?;
        let mut out = Vec::new();
        for item in invites.iter()? {
            let (_, value) = item?;
            let invite: InviteRow = decode(value.value())?;
            if invite.email == email && invite.status == InviteStatus::Pending {
                out.push(invite);
            }
        }
        Ok(out)
    }

    pub fn get_invite(&self, invite_id: &str) -> Result<InviteRow, RegistryError> {
        let txn = self.db().begin_read()?;
        let invites = txn.open_table(db::INVITES)?;
        let guard = invites
            .get(invite_id)?
            .ok_or_else(|| RegistryError::NotFound("invite".to_string()))?;
        decode(guard.value())
    }

    pub fn cancel_invite(&self, invite_id: &str) -> Result<(), RegistryError> {
        self.settle_invite(invite_id, InviteStatus::Cancelled, None)
    }

    /// Accept on behalf of an OIDC-authenticated user; the invite email must
    /// match and the invite must be pending and unexpired. Adds membership.
    pub fn accept_invite(&self, invite_id: &str, user: &UserRow) -> Result<(), RegistryError> {
        self.settle_invite(invite_id, InviteStatus::Accepted, Some(user))
    }

    pub fn decline_invite(&self, invite_id: &str, user: &UserRow) -> Result<(), RegistryError> {
        self.settle_invite(invite_id, InviteStatus::Declined, Some(user))
    }

    fn settle_invite(
        &self,
        invite_id: &str,
        outcome: InviteStatus,
        user: Option<&UserRow>,
    ) -> Result<(), RegistryError> {
        let txn = self.db().begin_write()?;
        {
            let mut invites = txn.open_table(db::INVITES)?;
            let mut invite: InviteRow = {
                let guard = invites
                    .get(invite_id)?
                    .ok_or_else(|| RegistryError::NotFound("invite".to_string()))?;
                decode(guard.value())?
            };

            if invite.status != InviteStatus::Pending {
                return Err(RegistryError::Conflict("invite is not pending".to_string()));
            }
            if let Some(user) = user {
                if !invite.email.eq_ignore_ascii_case(&user.email) {
                    return Err(RegistryError::Forbidden(
                        "invite is addressed to a different email".to_string(),
                    ));
                }
            }
            if outcome == InviteStatus::Accepted && invite.expires_at <= Utc::now() {
                return Err(RegistryError::Conflict("invite has expired".to_string()));
            }

            invite.status = outcome;
            invites.insert(invite_id, encode(&invite)?.as_slice())?;

            let mut pending = txn.open_table(db::PENDING_INVITES)?;
            pending.remove(db::key2(&invite.organization_id, &invite.email).as_str())?;

            if outcome == InviteStatus::Accepted {
                let user = user.expect("accept requires a user");
                let mut memberships = txn.open_table(db::MEMBERSHIPS)?;
                let key = db::key2(&invite.organization_id, &user.id);
                if memberships.get(key.as_str())?.is_none() {
                    let membership = MembershipRow {
                        organization_id: invite.organization_id.clone(),
                        user_id: user.id.clone(),
                        role: invite.role,
                        created_at: Utc::now(),
                    };
                    memberships.insert(key.as_str(), encode(&membership)?.as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Workspaces owning an invite's organization (for the invite DTO).
    pub fn workspaces_of_org(&self, org_id: &str) -> Result<Vec<WorkspaceRow>, RegistryError> {
        let txn = self.db().begin_read()?;
        let workspaces = txn.open_table(db::WORKSPACES)?;
        let mut out = Vec::new();
        for item in workspaces.iter()? {
            let (_, value) = item?;
            let workspace: WorkspaceRow = decode(value.value())?;
            if workspace.organization_id == org_id {
                out.push(workspace);
            }
        }
        Ok(out)
    }
}

fn count_owners(
    memberships: &impl ReadableTable<&'static str, &'static [u8]>,
    org_id: &str,
) -> Result<usize, RegistryError> {
    let (start, end) = db::prefix_range(org_id);
    let mut owners = 0;
    for item in memberships.range(start.as_str()..end.as_str())? {
        let (_, value) = item?;
        let row: MembershipRow = decode(value.value())?;
        if row.role == Role::Owner {
            owners += 1;
        }
    }
    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stardag_types::UpdateWorkspaceRequest as UpdateReq;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("registry.redb")).unwrap();
        (dir, store)
    }

    fn oidc_user(store: &Store, sub: &str, email: &str) -> UserRow {
        store.get_or_create_oidc_user(sub, email, None).unwrap()
    }

    #[test]
    fn seed_provides_default_tenancy() {
        let (_dir, store) = test_store();
        let workspace = store.get_workspace(DEFAULT_WORKSPACE_ID).unwrap();
        assert_eq!(workspace.slug, "default");
        let env = store.get_environment(DEFAULT_ENVIRONMENT_ID).unwrap();
        assert_eq!(env.workspace_id, DEFAULT_WORKSPACE_ID);
        assert_eq!(
            store
                .role_in_org(DEFAULT_ORG_ID, DEFAULT_USER_ID)
                .unwrap(),
            Some(Role::Owner)
        );

        // Reopening does not duplicate the seed.
        store.ensure_seed().unwrap();
        assert_eq!(store.list_environments(DEFAULT_WORKSPACE_ID).unwrap().len(), 1);
    }

    #[test]
    fn oidc_user_provisioning_updates_email() {
        let (_dir, store) = test_store();
        let created = oidc_user(&store, "sub-1", "old@example.com");
        let same = oidc_user(&store, "sub-1", "old@example.com");
        assert_eq!(created.id, same.id);

        let renamed = oidc_user(&store, "sub-1", "new@example.com");
        assert_eq!(renamed.id, created.id);
        assert_eq!(renamed.email, "new@example.com");
    }

    #[test]
    fn workspace_bootstrap_creates_org_membership_and_default_env() {
        let (_dir, store) = test_store();
        let user = oidc_user(&store, "sub-1", "alice@example.com");
        let workspace = store
            .create_workspace(&user, &CreateWorkspaceRequest {
                name: "Acme".to_string(),
                slug: "acme".to_string(),
                description: None,
            }, 10)
            .unwrap();

        assert_eq!(
            store.role_in_org(&workspace.organization_id, &user.id).unwrap(),
            Some(Role::Owner)
        );
        let envs = store.list_environments(&workspace.id).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].slug, "default");

        let dup = store.create_workspace(&user, &CreateWorkspaceRequest {
            name: "Other".to_string(),
            slug: "acme".to_string(),
            description: None,
        }, 10);
        assert!(matches!(dup, Err(RegistryError::Conflict(_))));

        let bad_slug = store.create_workspace(&user, &CreateWorkspaceRequest {
            name: "Bad".to_string(),
            slug: "Not A Slug".to_string(),
            description: None,
        }, 10);
        assert!(matches!(bad_slug, Err(RegistryError::Validation(_))));
    }

    #[test]
    fn creation_cap_is_enforced() {
        let (_dir, store) = test_store();
        let user = oidc_user(&store, "sub-1", "alice@example.com");
        store
            .create_workspace(&user, &CreateWorkspaceRequest {
                name: "One".to_string(),
                slug: "one".to_string(),
                description: None,
            }, 1)
            .unwrap();
        let second = store.create_workspace(&user, &CreateWorkspaceRequest {
            name: "Two".to_string(),
            slug: "two".to_string(),
            description: None,
        }, 1);
        assert!(matches!(second, Err(RegistryError::Forbidden(_))));
    }

    #[test]
    fn sole_owner_cannot_be_demoted_or_removed() {
        let (_dir, store) = test_store();
        let owner = oidc_user(&store, "sub-1", "owner@example.com");
        let workspace = store
            .create_workspace(&owner, &CreateWorkspaceRequest {
                name: "Acme".to_string(),
                slug: "acme".to_string(),
                description: None,
            }, 10)
            .unwrap();
        let org = workspace.organization_id.clone();

        assert!(matches!(
            store.update_member_role(&org, &owner.id, Role::Member),
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            store.remove_member(&org, &owner.id),
            Err(RegistryError::Validation(_))
        ));

        // With a second owner the original can step down.
        let invite = store
            .create_invite(&org, "second@example.com", Role::Owner, &owner.id)
            .unwrap();
        let second = oidc_user(&store, "sub-2", "second@example.com");
        store.accept_invite(&invite.id, &second).unwrap();

        store.update_member_role(&org, &owner.id, Role::Member).unwrap();
        assert_eq!(store.role_in_org(&org, &owner.id).unwrap(), Some(Role::Member));
    }

    #[test]
    fn pending_invite_uniqueness_and_lifecycle() {
        let (_dir, store) = test_store();
        let owner = oidc_user(&store, "sub-1", "owner@example.com");
        let workspace = store
            .create_workspace(&owner, &CreateWorkspaceRequest {
                name: "Acme".to_string(),
                slug: "acme".to_string(),
                description: None,
            }, 10)
            .unwrap();
        let org = workspace.organization_id.clone();

        store
            .create_invite(&org, "guest@example.com", Role::Member, &owner.id)
            .unwrap();
        let duplicate = store.create_invite(&org, "guest@example.com", Role::Member, &owner.id);
        assert!(matches!(duplicate, Err(RegistryError::Conflict(_))));

        let pending = store.pending_invites_for_email("guest@example.com").unwrap();
        assert_eq!(pending.len(), 1);

        // Wrong email cannot accept.
        let wrong = oidc_user(&store, "sub-9", "stranger@example.com");
        assert!(matches!(
            store.accept_invite(&pending[0].id, &wrong),
            Err(RegistryError::Forbidden(_))
        ));

        let guest = oidc_user(&store, "sub-2", "guest@example.com");
        store.accept_invite(&pending[0].id, &guest).unwrap();
        assert_eq!(store.role_in_org(&org, &guest.id).unwrap(), Some(Role::Member));

        // The pending slot is free again and settled invites stay settled.
        store
            .create_invite(&org, "guest@example.com", Role::Admin, &owner.id)
            .unwrap();
        assert!(matches!(
            store.accept_invite(&pending[0].id, &guest),
            Err(RegistryError::Conflict(_))
        ));
    }

    #[test]
    fn workspace_update_and_delete_cascade() {
        let (_dir, store) = test_store();
        let owner = oidc_user(&store, "sub-1", "owner@example.com");
        let workspace = store
            .create_workspace(&owner, &CreateWorkspaceRequest {
                name: "Acme".to_string(),
                slug: "acme".to_string(),
                description: None,
            }, 10)
            .unwrap();

        let updated = store
            .update_workspace(&workspace.id, &UpdateReq {
                name: Some("Acme Corp".to_string()),
                description: Some("renamed".to_string()),
            })
            .unwrap();
        assert_eq!(updated.name, "Acme Corp");

        store.delete_workspace(&workspace.id).unwrap();
        assert!(matches!(
            store.get_workspace(&workspace.id),
            Err(RegistryError::NotFound(_))
        ));
        // Org went with its last workspace; the slug is reusable.
        store
            .create_workspace(&owner, &CreateWorkspaceRequest {
                name: "Acme".to_string(),
                slug: "acme".to_string(),
                description: None,
            }, 10)
            .unwrap();
    }

    #[test]
    fn api_key_roundtrip_and_revocation() {
        let (_dir, store) = test_store();
        let (row, full_key) = store
            .create_api_key(DEFAULT_ENVIRONMENT_ID, "ci", Some(DEFAULT_USER_ID))
            .unwrap();
        assert!(full_key.starts_with("sk_"));
        assert_eq!(row.key_prefix.len(), 8);

        let resolved = store.resolve_api_key(&full_key).unwrap();
        assert_eq!(resolved.id, row.id);
        assert_eq!(resolved.environment_id, DEFAULT_ENVIRONMENT_ID);
        assert!(resolved.last_used_at.is_some());

        assert!(matches!(
            store.resolve_api_key("sk_definitely-not-a-key"),
            Err(RegistryError::Auth(_))
        ));

        store.revoke_api_key(DEFAULT_ENVIRONMENT_ID, &row.id).unwrap();
        assert!(matches!(
            store.resolve_api_key(&full_key),
            Err(RegistryError::Auth(_))
        ));
    }

    #[test]
    fn sole_environment_cannot_be_deleted() {
        let (_dir, store) = test_store();
        let err = store.delete_environment(DEFAULT_ENVIRONMENT_ID);
        assert!(matches!(err, Err(RegistryError::Validation(_))));

        store
            .create_environment(DEFAULT_WORKSPACE_ID, &stardag_types::CreateEnvironmentRequest {
                name: "Staging".to_string(),
                slug: "staging".to_string(),
                description: None,
                owner_user_id: None,
                max_concurrent_locks: None,
            })
            .unwrap();
        store.delete_environment(DEFAULT_ENVIRONMENT_ID).unwrap();
        assert_eq!(store.list_environments(DEFAULT_WORKSPACE_ID).unwrap().len(), 1);
    }
}
