//! Password hashing and role-based access checks.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{Role, User};

/// Hashes a password with Argon2id and returns the PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Password(e.to_string()))
}

/// Returns `Ok(false)` on a mismatch and an error only when the stored hash is unusable.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| AppError::Password(e.to_string()))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AppError::Password(e.to_string())),
    }
}

/// Resolves a login attempt. Unknown accounts and wrong passwords are
/// reported identically.
pub fn check_credentials(user: Option<User>, password: &str) -> Result<User> {
    let user = user.ok_or(AppError::InvalidCredentials)?;
    if verify_password(password, &user.password_hash)? {
        Ok(user)
    } else {
        Err(AppError::InvalidCredentials)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ManageUsers,
    ManageStudents,
    RecordMetrics,
    ImportData,
    ViewStudents,
    ViewOwnRecord,
    RunReports,
    VerifyMetrics,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ManageUsers => "manage_users",
            Action::ManageStudents => "manage_students",
            Action::RecordMetrics => "record_metrics",
            Action::ImportData => "import_data",
            Action::ViewStudents => "view_students",
            Action::ViewOwnRecord => "view_own_record",
            Action::RunReports => "run_reports",
            Action::VerifyMetrics => "verify_metrics",
        }
    }
}

pub fn role_allows(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => true,
        Role::Counselor => action != Action::ManageUsers,
        Role::Student => action == Action::ViewOwnRecord,
    }
}

/// The authenticated user a command runs on behalf of.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
    pub student_id: Option<Uuid>,
}

impl From<User> for Actor {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            email: user.email,
            role: user.role,
            student_id: user.student_id,
        }
    }
}

impl Actor {
    pub fn authorize(&self, action: Action) -> Result<()> {
        if role_allows(self.role, action) {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "{} accounts may not {}",
                self.role,
                action.as_str()
            )))
        }
    }

    /// The student record a student account is scoped to.
    pub fn own_student_id(&self) -> Result<Uuid> {
        self.authorize(Action::ViewOwnRecord)?;
        match (self.role, self.student_id) {
            (Role::Student, Some(id)) => Ok(id),
            _ => Err(AppError::Forbidden("not a student account".to_string())),
        }
    }
}

/// The first account ever created has to be an admin.
fn check_bootstrap(any_users: bool, role: Role) -> Result<()> {
    if !any_users && role != Role::Admin {
        return Err(AppError::validation("role", "the first user must be an admin"));
    }
    Ok(())
}

/// Decides whether an account with `role` may be created. Callers must hold
/// the bootstrap lock while reading `any_users` so two first accounts cannot
/// both pass.
pub fn authorize_account_creation(
    any_users: bool,
    actor: Option<&Actor>,
    role: Role,
) -> Result<()> {
    check_bootstrap(any_users, role)?;
    if any_users {
        actor
            .ok_or(AppError::InvalidCredentials)?
            .authorize(Action::ManageUsers)?;
    }
    Ok(())
}
