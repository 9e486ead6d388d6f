use chrono::Utc;
use colored::Colorize;
use zeroize::Zeroize;

use super::{context, prompt, require};
use crate::api::auth::validate_new_password;
use crate::api::ApiClient;
use crate::error::Result;
use crate::fmt::datetime;
use crate::guard::Route;

pub fn login(email: Option<String>) -> Result<()> {
    let (settings, store) = context();
    let email = match email {
        Some(e) => e,
        None => prompt("Email: ")?,
    };
    let mut password = rpassword::prompt_password("Password: ")?;
    let result = ApiClient::anonymous(&settings).and_then(|c| c.login(&email, &password));
    password.zeroize();
    let session = result?;
    store.set_session(&session)?;

    println!(
        "{} {}",
        "Logged in as".green(),
        session.user.display_name().bold()
    );
    if let Some(advice) = session.user.password_advice(Utc::now()) {
        println!("{}", advice.message().yellow());
    }
    Ok(())
}

pub fn logout() -> Result<()> {
    let (_, store) = context();
    store.clear_session()?;
    println!("Logged out.");
    Ok(())
}

pub fn recover(email: &str) -> Result<()> {
    let (settings, _) = context();
    let resp = ApiClient::anonymous(&settings)?.recover_password(email)?;
    if resp.message.is_empty() {
        println!("If the account exists, a recovery email has been sent.");
    } else {
        println!("{}", resp.message);
    }
    Ok(())
}

fn read_new_password() -> Result<String> {
    let mut new_password = rpassword::prompt_password("New password: ")?;
    let mut confirmation = rpassword::prompt_password("Confirm new password: ")?;
    let checked = validate_new_password(&new_password, &confirmation);
    confirmation.zeroize();
    if let Err(e) = checked {
        new_password.zeroize();
        return Err(e);
    }
    Ok(new_password)
}

pub fn reset_password(token: &str) -> Result<()> {
    let (settings, _) = context();
    let mut new_password = read_new_password()?;
    let result = ApiClient::anonymous(&settings).and_then(|c| c.reset_password(token, &new_password));
    new_password.zeroize();
    let resp = result?;
    println!("{}", non_empty_or(&resp.message, "Password updated. You can log in now.").green());
    Ok(())
}

pub fn passwd() -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::ChangePassword)?;
    let mut current = rpassword::prompt_password("Current password: ")?;
    let mut new_password = match read_new_password() {
        Ok(p) => p,
        Err(e) => {
            current.zeroize();
            return Err(e);
        }
    };
    let result = ApiClient::from_session(&settings, &store)
        .and_then(|c| c.change_password(&session.user.email, &current, &new_password));
    current.zeroize();
    new_password.zeroize();
    result?;
    store.mark_password_changed(Utc::now())?;
    println!("{}", "Password updated.".green());
    Ok(())
}

pub fn whoami() -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::Dashboard)?;
    let user = &session.user;
    println!("{}", user.display_name().bold());
    if let Some(legal) = user.legal_name.as_deref().filter(|l| *l != user.name) {
        println!("  Legal name:  {legal}");
    }
    println!("  Email:       {}", user.email);
    let location: Vec<&str> = [user.address.as_deref(), user.district.as_deref(), user.province.as_deref()]
        .into_iter()
        .flatten()
        .filter(|s| !s.trim().is_empty())
        .collect();
    if !location.is_empty() {
        println!("  Address:     {}", location.join(", "));
    }
    println!("  Role:        {}", if user.is_admin { "Administrator" } else { "User" });
    println!(
        "  Password:    last changed {}",
        datetime(user.last_password_change.as_deref())
    );
    println!("  Server:      {}", settings.api_base_url);
    if let Some(advice) = user.password_advice(Utc::now()) {
        println!("{}", advice.message().yellow());
    }
    Ok(())
}

fn non_empty_or<'a>(msg: &'a str, fallback: &'a str) -> &'a str {
    if msg.trim().is_empty() {
        fallback
    } else {
        msg
    }
}
