use diesel::{prelude::*, PgConnection};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ErrorKind};
use crate::models::{NewUser, User};
use crate::schema::users;

use super::password::{self, MIN_PASSWORD_LENGTH};

pub fn normalize_email(raw: &str) -> AppResult<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::bad_request("a valid email address is required"));
    }
    Ok(email)
}

pub fn validate_password(raw: &str) -> AppResult<()> {
    if raw.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::bad_request(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

pub fn create_user(conn: &mut PgConnection, email: &str, raw_password: &str) -> AppResult<User> {
    let email = normalize_email(email)?;
    validate_password(raw_password)?;

    let new_user = NewUser {
        id: Uuid::new_v4(),
        email,
        password_hash: password::hash_password(raw_password)?,
    };

    diesel::insert_into(users::table)
        .values(&new_user)
        .execute(conn)
        .map_err(|err| match AppError::from(err) {
            conflict if conflict.kind() == ErrorKind::Conflict => {
                AppError::conflict("an account with this email already exists")
            }
            other => other,
        })?;

    Ok(users::table.find(new_user.id).first(conn)?)
}

/// Unknown emails and wrong passwords are indistinguishable to the caller.
pub fn authenticate(conn: &mut PgConnection, email: &str, raw_password: &str) -> AppResult<User> {
    let email = email.trim().to_lowercase();
    let user = users::table
        .filter(users::email.eq(&email))
        .first::<User>(conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    let valid = password::verify_password(raw_password, &user.password_hash)
        .map_err(|_| AppError::unauthorized())?;
    if !valid {
        return Err(AppError::unauthorized());
    }
    Ok(user)
}
