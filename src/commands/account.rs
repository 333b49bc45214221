use crate::accounts::Account;
use crate::config::{
    AccountAuth, AccountConfig, AppConfig, app_home_dir, config_file_path, load_config, save_config,
};
use crate::{AccountCommand, CliError, CliResult};

pub async fn handle_account_cmd(cmd: AccountCommand) -> CliResult<()> {
    let mut cfg = load_config()
        .await
        .map_err(|e| CliError::Config(e.to_string()))?;
    let cfg_path = config_file_path(&app_home_dir());

    match cmd {
        AccountCommand::List => {
            if cfg.accounts.is_empty() {
                println!("No accounts in {:?}", cfg_path);
                return Ok(());
            }
            println!("Accounts (from {:?}):", cfg_path);
            for (id, account_cfg) in &cfg.accounts {
                let account = Account::from_config(id, account_cfg);
                let marker = if account.disabled { "-" } else { "*" };
                let auth = match (
                    account.auth.resolve_access_token().is_some(),
                    account.auth.resolve_cookie().is_some(),
                ) {
                    (true, _) => "token",
                    (false, true) => "cookie",
                    (false, false) => "no credentials",
                };
                if account.name != account.id {
                    println!(
                        "  {} {} [{}] {} ({})",
                        marker, account.id, account.name, account.base_url, auth
                    );
                } else {
                    println!("  {} {} {} ({})", marker, account.id, account.base_url, auth);
                }
            }
        }
        AccountCommand::Add {
            id,
            base_url,
            name,
            user_id,
            access_token,
            access_token_env,
            cookie,
        } => {
            if base_url.trim().is_empty() {
                return Err(CliError::Usage("--base-url must not be empty".to_string()));
            }
            let replaced = cfg.accounts.insert(
                id.clone(),
                AccountConfig {
                    name,
                    base_url,
                    user_id,
                    auth: AccountAuth {
                        access_token,
                        access_token_env,
                        cookie,
                    },
                    disabled: false,
                },
            );
            save_config(&cfg)
                .await
                .map_err(|e| CliError::Config(e.to_string()))?;
            if replaced.is_some() {
                println!("Updated account '{}'", id);
            } else {
                println!("Added account '{}'", id);
            }
        }
        AccountCommand::Remove { id } => {
            if cfg.accounts.remove(&id).is_none() {
                println!("Account '{}' not found", id);
                return Ok(());
            }
            save_config(&cfg)
                .await
                .map_err(|e| CliError::Config(e.to_string()))?;
            println!("Removed account '{}'", id);
        }
        AccountCommand::Enable { id } => set_disabled(&mut cfg, &id, false).await?,
        AccountCommand::Disable { id } => set_disabled(&mut cfg, &id, true).await?,
    }

    Ok(())
}

async fn set_disabled(cfg: &mut AppConfig, id: &str, disabled: bool) -> CliResult<()> {
    let Some(account) = cfg.accounts.get_mut(id) else {
        println!("Account '{}' not found", id);
        return Ok(());
    };
    account.disabled = disabled;
    save_config(cfg)
        .await
        .map_err(|e| CliError::Config(e.to_string()))?;
    println!(
        "Account '{}' {}",
        id,
        if disabled { "disabled" } else { "enabled" }
    );
    Ok(())
}
