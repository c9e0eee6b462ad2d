//! Organization lifecycle coordinator
//!
//! Creation, merge, profile change requests and receipt addresses. Each
//! operation runs in a single unit of work.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use validator::{Validate, ValidateEmail};

use crate::db::{
    ChangeLogRepository, ChangeRequestRepository, ChargeRepository, InvitationRepository, MembershipRepository,
    NewChangeLog, NewOrganization, OrganizationRepository, PlanRepository, ReceiptEmailRepository,
    SubscriptionRepository, UserRepository,
};
use crate::models::{
    ChangeLogReason, ChangeRequestStatus, CreateOrganizationRequest, CreateUserRequest, MergeRecord, Organization,
    OrganizationState, ProfileChangeRequest, ProfileFields, User,
};
use crate::services::hooks::{DomainEvent, UnitOfWork};
use crate::services::invalidation::RequestContext;
use crate::services::mailer::{Email, EmailTemplate, Recipients};
use crate::services::membership::insert_membership;
use crate::services::{load_organization, load_user, Services};
use crate::utils::validation::{slugify, validate_email_domain, validate_slug, validate_username};
use crate::utils::{AppError, AppResult};

pub struct OrganizationCoordinator<'a> {
    services: &'a Services,
}

impl<'a> OrganizationCoordinator<'a> {
    pub(crate) fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Create a user together with its individual organization.
    ///
    /// The organization shares the user's id, has a single seat and lists the
    /// user as its only admin.
    pub async fn register_user(&self, ctx: &mut RequestContext, req: CreateUserRequest) -> AppResult<(User, Organization)> {
        req.validate()?;
        if !validate_username(&req.username) {
            return Err(AppError::BadRequest(format!("Invalid username: {}", req.username)));
        }

        let mut uow = self.services.begin().await?;
        let user = UserRepository::new(uow.conn()).create(&req).await?;
        let org = OrganizationRepository::new(uow.conn())
            .create(&NewOrganization {
                id: user.id,
                name: user.username.clone(),
                slug: slugify(&user.username),
                individual: true,
                private: true,
                verified_journalist: false,
                max_users: 1,
            })
            .await?;

        insert_membership(&mut uow, user.id, org.id, true).await?;
        if let Some(email) = &user.email {
            ReceiptEmailRepository::new(uow.conn()).add(org.id, email).await?;
        }
        uow.commit(ctx).await?;

        info!(user_id = %user.id, username = %user.username, "User registered");
        Ok((user, org))
    }

    /// Create a group organization with `creator_id` as its first admin
    pub async fn create_organization(
        &self,
        ctx: &mut RequestContext,
        creator_id: Uuid,
        req: CreateOrganizationRequest,
    ) -> AppResult<Organization> {
        req.validate()?;
        if !validate_slug(&req.slug) {
            return Err(AppError::BadRequest(format!("Invalid slug: {}", req.slug)));
        }

        let mut uow = self.services.begin().await?;
        let creator = load_user(uow.conn(), creator_id).await?;
        let org = OrganizationRepository::new(uow.conn())
            .create(&NewOrganization {
                id: Uuid::new_v4(),
                name: req.name.clone(),
                slug: req.slug.clone(),
                individual: false,
                private: req.private,
                verified_journalist: req.verified_journalist,
                max_users: req.max_users,
            })
            .await?;

        insert_membership(&mut uow, creator.id, org.id, true).await?;
        if let Some(email) = &creator.email {
            ReceiptEmailRepository::new(uow.conn()).add(org.id, email).await?;
        }
        ChangeLogRepository::new(uow.conn())
            .create(&NewChangeLog {
                organization_id: org.id,
                user_id: Some(creator.id),
                reason: ChangeLogReason::Created,
                from_plan_id: None,
                to_plan_id: None,
                from_max_users: None,
                to_max_users: Some(org.max_users),
            })
            .await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));
        uow.commit(ctx).await?;

        info!(organization_id = %org.id, creator_id = %creator.id, "Organization created");
        Ok(org)
    }

    /// Merge `source_id` into `target_id`.
    ///
    /// Everything attached to the source moves to the target and the source
    /// is left private and marked merged. Nothing is written unless every
    /// step succeeds.
    pub async fn merge(
        &self,
        ctx: &mut RequestContext,
        target_id: Uuid,
        source_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> AppResult<()> {
        if target_id == source_id {
            return Err(AppError::validation("An organization may not be merged into itself"));
        }

        let mut uow = self.services.begin().await?;
        let mut target = load_organization(uow.conn(), target_id).await?;
        let mut source = load_organization(uow.conn(), source_id).await?;

        for org in [&target, &source] {
            if org.is_merged() {
                return Err(AppError::validation(format!(
                    "{} has already been merged, and may not be merged again",
                    org.name
                )));
            }
            if org.individual {
                return Err(AppError::validation(format!(
                    "{} is an individual organization, and may not be merged",
                    org.name
                )));
            }
        }
        if SubscriptionRepository::new(uow.conn()).has_external(source.id).await? {
            return Err(AppError::validation(format!(
                "{} has an active subscription, and may not be merged",
                source.name
            )));
        }

        let charges = ChargeRepository::new(uow.conn()).reassign(source.id, target.id).await?;
        let moved_users = MembershipRepository::new(uow.conn())
            .reassign(source.id, target.id)
            .await?;
        let invitations = InvitationRepository::new(uow.conn())
            .reassign(source.id, target.id)
            .await?;
        ReceiptEmailRepository::new(uow.conn())
            .reassign(source.id, target.id)
            .await?;
        PlanRepository::new(uow.conn())
            .reassign_grants(source.id, target.id)
            .await?;
        OrganizationRepository::new(uow.conn())
            .reassign_relations(source.id, target.id)
            .await?;

        if target.parent_id.is_none() && source.parent_id != Some(target.id) {
            if let Some(parent) = source.parent_id {
                target.parent_id = Some(parent);
                OrganizationRepository::new(uow.conn()).save(&target).await?;
            }
        }

        source.private = true;
        source.state = OrganizationState::MergedInto(target.id);
        source.merge = Some(MergeRecord {
            merged_at: Utc::now(),
            merged_by: actor_id,
        });
        OrganizationRepository::new(uow.conn()).save(&source).await?;

        for user_id in &moved_users {
            uow.raise(DomainEvent::UserChanged(*user_id));
        }
        uow.raise(DomainEvent::OrganizationsChanged(vec![target.id, source.id]));
        uow.commit(ctx).await?;

        info!(
            target_id = %target.id,
            source_id = %source.id,
            members = moved_users.len(),
            charges,
            invitations,
            "Organizations merged"
        );
        Ok(())
    }

    /// Ask staff to change sensitive profile fields.
    ///
    /// Requests from non-staff users also email the support address.
    pub async fn submit_change_request(
        &self,
        ctx: &mut RequestContext,
        organization_id: Uuid,
        user_id: Uuid,
        requested: ProfileFields,
    ) -> AppResult<ProfileChangeRequest> {
        if requested.is_blank() {
            return Err(AppError::BadRequest("No changes requested".to_string()));
        }
        if !requested.slug.trim().is_empty() && !validate_slug(&requested.slug) {
            return Err(AppError::BadRequest(format!("Invalid slug: {}", requested.slug)));
        }

        let mut uow = self.services.begin().await?;
        let org = load_organization(uow.conn(), organization_id).await?;
        if org.is_merged() {
            return Err(AppError::validation(format!("{} has been merged", org.name)));
        }
        let user = load_user(uow.conn(), user_id).await?;

        let request = ChangeRequestRepository::new(uow.conn())
            .create(org.id, Some(user.id), &requested, &ProfileFields::of(&org))
            .await?;

        if !user.is_staff {
            match &self.services.config.email.support_address {
                Some(support) => uow.email(Email::new(
                    EmailTemplate::ChangeRequestTicket,
                    format!("Change request: {}", org.name),
                    Recipients::To(vec![support.clone()]),
                    json!({
                        "organization": org.name,
                        "user": user.name,
                        "request": request.id,
                        "requested": requested,
                        "previous": request.previous,
                    }),
                )),
                None => warn!(request_id = %request.id, "No support address configured for change request ticket"),
            }
        }
        uow.commit(ctx).await?;

        info!(organization_id = %org.id, request_id = %request.id, "Change request submitted");
        Ok(request)
    }

    /// Apply the non-blank requested fields to the organization
    pub async fn accept_change_request(&self, ctx: &mut RequestContext, request_id: Uuid) -> AppResult<Organization> {
        let mut uow = self.services.begin().await?;
        let request = self.resolve_change_request(&mut uow, request_id, ChangeRequestStatus::Accepted).await?;

        let mut org = load_organization(uow.conn(), request.organization_id).await?;
        request.requested.apply_to(&mut org);
        OrganizationRepository::new(uow.conn()).save(&org).await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));
        uow.commit(ctx).await?;

        info!(organization_id = %org.id, request_id = %request_id, "Change request accepted");
        Ok(org)
    }

    pub async fn reject_change_request(&self, ctx: &mut RequestContext, request_id: Uuid) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        self.resolve_change_request(&mut uow, request_id, ChangeRequestStatus::Rejected)
            .await?;
        uow.commit(ctx).await?;

        info!(request_id = %request_id, "Change request rejected");
        Ok(())
    }

    async fn resolve_change_request(
        &self,
        uow: &mut UnitOfWork,
        request_id: Uuid,
        status: ChangeRequestStatus,
    ) -> AppResult<ProfileChangeRequest> {
        let mut repo = ChangeRequestRepository::new(uow.conn());
        let request = repo
            .get(request_id)
            .await?
            .ok_or_else(|| AppError::not_found("Change request", request_id))?;
        if !repo.resolve(request_id, status).await? {
            return Err(AppError::validation(format!(
                "This change request has already been {}",
                request.status
            )));
        }
        Ok(request)
    }

    /// Replace the addresses that receive receipts
    pub async fn set_receipt_emails(
        &self,
        ctx: &mut RequestContext,
        organization_id: Uuid,
        emails: &[String],
    ) -> AppResult<Vec<String>> {
        let mut cleaned: Vec<String> = Vec::with_capacity(emails.len());
        for email in emails {
            let email = email.trim().to_lowercase();
            if !email.validate_email() {
                return Err(AppError::BadRequest(format!("Invalid email address: {}", email)));
            }
            if !cleaned.contains(&email) {
                cleaned.push(email);
            }
        }

        let mut uow = self.services.begin().await?;
        load_organization(uow.conn(), organization_id).await?;
        ReceiptEmailRepository::new(uow.conn())
            .replace(organization_id, &cleaned)
            .await?;
        uow.commit(ctx).await?;

        Ok(cleaned)
    }

    /// Register a domain whose verified users may join without an invitation
    pub async fn add_email_domain(&self, ctx: &mut RequestContext, organization_id: Uuid, domain: &str) -> AppResult<()> {
        let domain = domain.trim().to_lowercase();
        if !validate_email_domain(&domain) {
            return Err(AppError::BadRequest(format!("Invalid email domain: {}", domain)));
        }

        let mut uow = self.services.begin().await?;
        let org = load_organization(uow.conn(), organization_id).await?;
        if org.individual {
            return Err(AppError::validation("Individual organizations cannot register email domains"));
        }
        OrganizationRepository::new(uow.conn())
            .add_email_domain(org.id, &domain)
            .await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));
        uow.commit(ctx).await?;
        Ok(())
    }

    pub async fn set_allow_auto_join(&self, ctx: &mut RequestContext, organization_id: Uuid, allow: bool) -> AppResult<()> {
        let mut uow = self.services.begin().await?;
        let mut org = load_organization(uow.conn(), organization_id).await?;
        org.allow_auto_join = allow;
        OrganizationRepository::new(uow.conn()).save(&org).await?;
        uow.raise(DomainEvent::OrganizationChanged(org.id));
        uow.commit(ctx).await?;
        Ok(())
    }
}
