use colored::Colorize;
use comfy_table::{Cell, Table};

use super::{client_for, context, prompt, require};
use crate::aggregate::{apply_status, group_users};
use crate::error::{ConsultaError, Result};
use crate::fmt::{datetime, yes_no};
use crate::guard::Route;
use crate::models::NewUser;
use crate::normalize::Ident;

pub fn list() -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::AdminUsers)?;
    let users = client_for(&settings, &session)?.list_users()?;
    if users.is_empty() {
        println!("No users registered.");
        return Ok(());
    }
    for group in group_users(users) {
        println!("\n{} ({})", group.display_name.bold(), group.members.len());
        let mut table = Table::new();
        table.set_header(vec!["ID", "Name", "Email", "Admin", "Active", "Created", "Password changed"]);
        for u in &group.members {
            let active = if u.active {
                "Active".green().to_string()
            } else {
                "Inactive".red().to_string()
            };
            table.add_row(vec![
                Cell::new(u.id.key()),
                Cell::new(&u.name),
                Cell::new(&u.email),
                Cell::new(yes_no(u.is_admin)),
                Cell::new(active),
                Cell::new(datetime(u.created_at.as_deref())),
                Cell::new(datetime(u.password_changed_at.as_deref())),
            ]);
        }
        println!("{table}");
    }
    Ok(())
}

pub fn add(dni: &str, email: &str, admin: bool) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::AdminUsers)?;
    let client = client_for(&settings, &session)?;
    let person = client.lookup_person(dni)?;
    println!("Found: {}", person.display_name().bold());
    let answer = prompt("Register this person? [y/N] ")?;
    if !answer.eq_ignore_ascii_case("y") {
        println!("Cancelled.");
        return Ok(());
    }
    let resp = client.create_user(&NewUser {
        ide_per: person.ide_per.clone(),
        cor_ele: email.trim().to_string(),
        flg_adm: u8::from(admin),
    })?;
    if resp.message.is_empty() {
        println!("{}", "User registered.".green());
    } else {
        println!("{}", resp.message.green());
    }
    Ok(())
}

pub fn toggle(id: &str) -> Result<()> {
    let (settings, store) = context();
    let session = require(&store, Route::AdminUsers)?;
    let client = client_for(&settings, &session)?;
    let mut users = client.list_users()?;
    let id = users
        .iter()
        .map(|u| u.id.clone())
        .find(|uid| uid.key() == id.trim())
        .unwrap_or_else(|| Ident::parse(id));
    let active = client.toggle_user_status(&users, &id)?;
    apply_status(&mut users, &id, active);
    let user = users
        .iter()
        .find(|u| u.id == id)
        .ok_or_else(|| ConsultaError::Other(format!("user {id} disappeared")))?;
    let state = if active { "active".green() } else { "inactive".red() };
    println!("{} is now {state}.", user.name);
    Ok(())
}
