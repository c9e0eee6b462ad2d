//! Membership and invitation engine
//!
//! Invitations are either join requests raised by a user or invites issued
//! by an admin. Either kind is closed exactly once, by accepting or
//! rejecting it, and closed invitations never change again.

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use validator::ValidateEmail;

use crate::db::{InvitationRepository, MembershipRepository, OrganizationRepository, UserRepository};
use crate::models::{Invitation, Invitee, Membership, Organization, User};
use crate::services::hooks::{DomainEvent, UnitOfWork};
use crate::services::invalidation::RequestContext;
use crate::services::mailer::{Email, EmailTemplate, Recipients};
use crate::services::roster_sync::resolve_targets;
use crate::services::{load_organization, load_user, Services};
use crate::utils::{AppError, AppResult};

pub const INVITATION_CLOSED: &str = "This invitation has already been closed";
pub const INVITATION_NEEDS_USER: &str = "Must give a user when accepting if invitation has no user";
pub const CAPACITY_EXCEEDED: &str = "capacity exceeded";

/// Members plus open admin invites; join requests hold no seat
pub(crate) async fn user_count(uow: &mut UnitOfWork, organization_id: Uuid) -> AppResult<i64> {
    let members = MembershipRepository::new(uow.conn())
        .count_for_organization(organization_id)
        .await?;
    let invites = InvitationRepository::new(uow.conn())
        .count_pending_invites(organization_id)
        .await?;
    Ok(members + invites)
}

/// Insert a membership inside `uow`, raising the created event.
///
/// Returns `None` without raising anything when the user is already a member.
pub(crate) async fn insert_membership(
    uow: &mut UnitOfWork,
    user_id: Uuid,
    organization_id: Uuid,
    admin: bool,
) -> AppResult<Option<Membership>> {
    let Some(membership) = MembershipRepository::new(uow.conn())
        .create(user_id, organization_id, admin)
        .await?
    else {
        return Ok(None);
    };

    let roster_targets = resolve_targets(uow.conn(), organization_id).await?;
    uow.raise(DomainEvent::MembershipCreated {
        user_id,
        organization_id,
        roster_targets,
    });
    Ok(Some(membership))
}

fn require_active(org: &Organization) -> AppResult<()> {
    if org.is_merged() {
        return Err(AppError::validation(format!(
            "{} has been merged and can no longer be joined",
            org.name
        )));
    }
    Ok(())
}

pub struct MembershipEngine<'a> {
    services: &'a Services,
}

impl<'a> MembershipEngine<'a> {
    pub(crate) fn new(services: &'a Services) -> Self {
        Self { services }
    }

    async fn require_admin(&self, uow: &mut UnitOfWork, actor: &User, organization_id: Uuid) -> AppResult<()> {
        if actor.is_staff {
            return Ok(());
        }
        let membership = MembershipRepository::new(uow.conn())
            .get(actor.id, organization_id)
            .await?;
        match membership {
            Some(m) if m.admin => Ok(()),
            _ => Err(AppError::Forbidden(
                "Only organization admins may invite members".to_string(),
            )),
        }
    }

    /// Open a join request (`as_request`) or an admin invite.
    ///
    /// A join request must be raised by the user it names. Admin invites need
    /// a free seat: members plus open invites must stay below `max_users`.
    pub async fn create_invitation(
        &self,
        ctx: &mut RequestContext,
        organization_id: Uuid,
        invitee: Invitee,
        as_request: bool,
        actor_id: Uuid,
    ) -> AppResult<Invitation> {
        let mut uow = self.services.begin().await?;
        let org = load_organization(uow.conn(), organization_id).await?;
        require_active(&org)?;
        let actor = load_user(uow.conn(), actor_id).await?;

        let (email, user_id) = if as_request {
            match invitee {
                Invitee::User(id) if id == actor.id => (actor.email.clone(), Some(actor.id)),
                _ => {
                    return Err(AppError::Forbidden(
                        "Join requests must be made by the requesting user".to_string(),
                    ))
                }
            }
        } else {
            self.require_admin(&mut uow, &actor, organization_id).await?;
            if user_count(&mut uow, organization_id).await? >= org.max_users {
                return Err(AppError::validation(CAPACITY_EXCEEDED));
            }
            match invitee {
                Invitee::Email(email) => {
                    let email = email.trim().to_lowercase();
                    if !email.validate_email() {
                        return Err(AppError::BadRequest(format!("Invalid email address: {}", email)));
                    }
                    (Some(email), None)
                }
                Invitee::User(id) => {
                    let user = load_user(uow.conn(), id).await?;
                    (user.email.clone(), Some(user.id))
                }
            }
        };

        let invitation = InvitationRepository::new(uow.conn())
            .create(organization_id, email.as_deref(), user_id, as_request)
            .await?;

        if as_request {
            uow.email(Email::new(
                EmailTemplate::JoinRequest,
                format!("{} has requested to join {}", actor.name, org.name),
                Recipients::OrganizationAdmins(organization_id),
                json!({
                    "organization": org.name,
                    "user": actor.name,
                    "invitation": invitation.id,
                }),
            ));
        } else if let Some(to) = &invitation.email {
            uow.email(Email::new(
                EmailTemplate::Invitation,
                format!("Invitation to join {}", org.name),
                Recipients::To(vec![to.clone()]),
                json!({
                    "organization": org.name,
                    "invitation": invitation.id,
                }),
            ));
        }

        uow.commit(ctx).await?;
        info!(
            organization_id = %organization_id,
            invitation_id = %invitation.id,
            request = as_request,
            "Invitation created"
        );
        Ok(invitation)
    }

    /// Accept an open invitation, creating the membership if needed
    pub async fn accept(&self, ctx: &mut RequestContext, invitation_id: Uuid, user_id: Option<Uuid>) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let mut invitation = InvitationRepository::new(uow.conn())
            .get(invitation_id)
            .await?
            .ok_or_else(|| AppError::not_found("Invitation", invitation_id))?;

        if invitation.is_closed() {
            return Err(AppError::validation(INVITATION_CLOSED));
        }
        let Some(accepting) = invitation.user_id.or(user_id) else {
            return Err(AppError::validation(INVITATION_NEEDS_USER));
        };

        let org = load_organization(uow.conn(), invitation.organization_id).await?;
        require_active(&org)?;
        let user = load_user(uow.conn(), accepting).await?;

        invitation.user_id = Some(accepting);
        invitation.accepted_at = Some(chrono::Utc::now());
        if !InvitationRepository::new(uow.conn()).close(&invitation).await? {
            return Err(AppError::validation(INVITATION_CLOSED));
        }

        if org.verified_journalist && !user.verified_journalist {
            UserRepository::new(uow.conn())
                .set_verified_journalist(user.id, true)
                .await?;
            uow.raise(DomainEvent::UserChanged(user.id));
            if let Some(email) = &user.email {
                uow.email(Email::new(
                    EmailTemplate::Verified,
                    format!("{} is verified", org.name),
                    Recipients::To(vec![email.clone()]),
                    json!({ "organization": org.name, "user": user.name }),
                ));
            }
        }

        let created = insert_membership(&mut uow, accepting, org.id, false).await?;
        uow.commit(ctx).await?;

        info!(
            invitation_id = %invitation_id,
            user_id = %accepting,
            organization_id = %org.id,
            new_member = created.is_some(),
            "Invitation accepted"
        );
        Ok(())
    }

    /// Reject a join request or revoke an invite
    pub async fn reject(&self, ctx: &mut RequestContext, invitation_id: Uuid) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let mut invitation = InvitationRepository::new(uow.conn())
            .get(invitation_id)
            .await?
            .ok_or_else(|| AppError::not_found("Invitation", invitation_id))?;

        if invitation.is_closed() {
            return Err(AppError::validation(INVITATION_CLOSED));
        }
        invitation.rejected_at = Some(chrono::Utc::now());
        if !InvitationRepository::new(uow.conn()).close(&invitation).await? {
            return Err(AppError::validation(INVITATION_CLOSED));
        }

        uow.commit(ctx).await?;
        info!(invitation_id = %invitation_id, "Invitation rejected");
        Ok(())
    }

    /// Add a member directly, bypassing invitations
    pub async fn add_member(
        &self,
        ctx: &mut RequestContext,
        organization_id: Uuid,
        user_id: Uuid,
        admin: bool,
    ) -> AppResult<Membership> {
        let mut uow = self.services.begin().await?;
        let org = load_organization(uow.conn(), organization_id).await?;
        require_active(&org)?;
        load_user(uow.conn(), user_id).await?;

        let membership = insert_membership(&mut uow, user_id, organization_id, admin)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("User {} is already a member of {}", user_id, org.name)))?;

        uow.commit(ctx).await?;
        Ok(membership)
    }

    /// Join an auto-join organization whose email domain matches the user's verified email
    pub async fn auto_join(&self, ctx: &mut RequestContext, organization_id: Uuid, user_id: Uuid) -> AppResult<Membership> {
        let mut uow = self.services.begin().await?;
        let user = load_user(uow.conn(), user_id).await?;
        let domain = user
            .verified_email_domain()
            .ok_or_else(|| AppError::Forbidden("A verified email address is required to join".to_string()))?;

        let eligible = OrganizationRepository::new(uow.conn())
            .find_auto_join(&domain)
            .await?
            .iter()
            .any(|org| org.id == organization_id);
        if !eligible {
            return Err(AppError::Forbidden(format!(
                "Users from {} may not join this organization without an invitation",
                domain
            )));
        }

        let membership = insert_membership(&mut uow, user_id, organization_id, false)
            .await?
            .ok_or_else(|| AppError::Conflict("Already a member".to_string()))?;

        uow.commit(ctx).await?;
        info!(user_id = %user_id, organization_id = %organization_id, domain = %domain, "User auto-joined");
        Ok(membership)
    }

    pub async fn remove_member(&self, ctx: &mut RequestContext, organization_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let mut repo = MembershipRepository::new(uow.conn());
        let membership = repo
            .get(user_id, organization_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} is not a member", user_id)))?;

        repo.delete(user_id, organization_id).await?;
        if membership.admin && repo.count_admins(organization_id).await? == 0 {
            warn!(organization_id = %organization_id, "Organization has no admins left");
        }
        uow.raise(DomainEvent::MembershipDeleted {
            user_id,
            organization_id,
        });

        uow.commit(ctx).await?;
        info!(user_id = %user_id, organization_id = %organization_id, "Member removed");
        Ok(())
    }

    pub async fn set_admin(
        &self,
        ctx: &mut RequestContext,
        organization_id: Uuid,
        user_id: Uuid,
        admin: bool,
    ) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let mut repo = MembershipRepository::new(uow.conn());
        if !repo.set_admin(user_id, organization_id, admin).await? {
            return Err(AppError::NotFound(format!("User {} is not a member", user_id)));
        }
        if !admin && repo.count_admins(organization_id).await? == 0 {
            warn!(organization_id = %organization_id, "Organization has no admins left");
        }
        uow.raise(DomainEvent::UserChanged(user_id));

        uow.commit(ctx).await?;
        Ok(())
    }

    /// Members plus pending admin invites
    pub async fn user_count(&self, organization_id: Uuid) -> AppResult<i64> {
        let mut uow = self.services.begin().await?;
        let count = user_count(&mut uow, organization_id).await?;
        uow.rollback().await?;
        Ok(count)
    }
}
