use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::task::JoinHandle;

use gatekeeper::app::AuthzState;
use gatekeeper::authz::{Attributes, EvalContext, Principal, ResourceContext};
use gatekeeper::config::AuthzConfig;
use gatekeeper::db;
use gatekeeper::events::{init_event_bus, spawn_audit_logger};
use gatekeeper::rbac::{NewAssignment, NewRole, RbacService, Role, SqliteRbacStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "gatekeeper authorization admin tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate,
    /// Show migration status against the current database
    MigrateStatus,
    /// Manage roles and their permissions
    #[command(subcommand)]
    Role(RoleCommand),
    /// List the permission catalog
    Catalog,
    /// Assign a role to a user
    Assign(AssignArgs),
    /// Remove a user's role assignment(s)
    Unassign(UnassignArgs),
    /// Show a user's role assignments
    Roles {
        user: String,
        /// Include expired and not-yet-valid assignments
        #[arg(long)]
        all: bool,
    },
    /// Show a user's effective permissions; scoped grants only count inside --resource
    Permissions {
        user: String,
        /// Resource attributes as a JSON object (e.g. '{"project_id":"p1"}')
        #[arg(long)]
        resource: Option<String>,
    },
    /// Evaluate an authorization request with the configured engine
    Check(CheckArgs),
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    /// Create a role
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = 0)]
        level: i32,
        #[arg(long = "org")]
        organization_id: Option<String>,
        /// Permission string, repeatable (e.g. posts:create)
        #[arg(long = "permission", short = 'p')]
        permissions: Vec<String>,
    },
    /// List roles
    List {
        #[arg(long = "org")]
        organization_id: Option<String>,
    },
    /// Show one role with its permissions
    Show { name: String },
    /// Delete a role and its assignments
    Delete { name: String },
    /// Grant a permission to a role
    Grant { role: String, permission: String },
    /// Revoke a permission from a role
    Revoke { role: String, permission: String },
}

#[derive(Args, Debug)]
struct AssignArgs {
    user: String,
    role: String,
    #[arg(long, requires = "scope_id")]
    scope_type: Option<String>,
    #[arg(long, requires = "scope_type")]
    scope_id: Option<String>,
    /// RFC3339 start of validity (default: now)
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// RFC3339 end of validity
    #[arg(long)]
    until: Option<DateTime<Utc>>,
    #[arg(long)]
    granted_by: Option<String>,
}

#[derive(Args, Debug)]
struct UnassignArgs {
    user: String,
    role: String,
    #[arg(long)]
    scope_type: Option<String>,
    #[arg(long)]
    scope_id: Option<String>,
}

#[derive(Args, Debug)]
struct CheckArgs {
    user: String,
    action: String,
    /// Resource attributes as a JSON object
    #[arg(long)]
    resource: Option<String>,
    #[arg(long)]
    resource_type: Option<String>,
    /// Conditions as a JSON object, e.g. '{"not_creator": true}'
    #[arg(long)]
    conditions: Option<String>,
    /// Extra context values as a JSON object, e.g. '{"amount": 500}'
    #[arg(long)]
    context: Option<String>,
    /// Treat the user as an admin
    #[arg(long)]
    admin: bool,
    /// Direct permission held by the actor (simple engine), repeatable
    #[arg(long = "permission", short = 'p')]
    permissions: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate => {
            let pool = db::init().await?;
            pool.close().await;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
            let pool = SqlitePool::connect(&database_url)
                .await
                .context("failed to connect to database")?;
            print_status(&pool).await?;
        }
        command => {
            let (state, audit) = build_state().await?;
            let rbac = state
                .rbac
                .clone()
                .context("rbac service not configured")?;
            let result = run(command, &state, &rbac).await;

            // Dropping the last senders closes the bus; the subscriber drains it and exits.
            drop(rbac);
            drop(state);
            audit.await.context("audit subscriber failed")?;
            result?;
        }
    }

    Ok(())
}

async fn build_state() -> anyhow::Result<(AuthzState, JoinHandle<usize>)> {
    let config = AuthzConfig::from_env()?;
    let pool = db::init().await?;
    let store = Arc::new(SqliteRbacStore::new(pool));

    let (bus, rx) = init_event_bus();
    let audit = spawn_audit_logger(rx);

    let state = AuthzState::with_rbac(config, store, Some(bus))?;
    Ok((state, audit))
}

async fn run(command: Commands, state: &AuthzState, rbac: &RbacService) -> anyhow::Result<()> {
    match command {
        Commands::Role(role) => run_role(role, rbac).await?,
        Commands::Catalog => {
            for permission in rbac.list_permissions().await? {
                match &permission.description {
                    Some(description) => {
                        println!("{:<32} {}", permission.permission_string(), description)
                    }
                    None => println!("{}", permission.permission_string()),
                }
            }
        }
        Commands::Assign(args) => {
            let role = find_role(rbac, &args.role).await?;
            let mut request = NewAssignment::new(args.user, role.id);
            request.scope_type = args.scope_type;
            request.scope_id = args.scope_id;
            request.valid_from = args.from;
            request.valid_until = args.until;
            request.granted_by = args.granted_by;

            let assignment = rbac.assign_role(request).await?;
            println!("Assigned {} to {} ({})", role.name, assignment.user_id, assignment.id);
        }
        Commands::Unassign(args) => {
            let role = find_role(rbac, &args.role).await?;
            let removed = rbac
                .revoke_role(
                    &args.user,
                    role.id,
                    args.scope_type.as_deref(),
                    args.scope_id.as_deref(),
                )
                .await?;
            if removed {
                println!("Removed {} from {}", role.name, args.user);
            } else {
                println!("{} has no matching assignment of {}", args.user, role.name);
            }
        }
        Commands::Roles { user, all } => {
            for assignment in rbac.get_user_roles(&user, all).await? {
                let name = rbac
                    .get_role(assignment.role_id)
                    .await?
                    .map(|role| role.name)
                    .unwrap_or_else(|| assignment.role_id.to_string());
                let scope = match (&assignment.scope_type, &assignment.scope_id) {
                    (Some(scope_type), Some(scope_id)) => format!("{scope_type}:{scope_id}"),
                    _ => "global".to_string(),
                };
                let until = assignment
                    .valid_until
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<24} {:<24} {} .. {}", name, scope, assignment.valid_from.to_rfc3339(), until);
            }
        }
        Commands::Permissions { user, resource } => {
            let resource = parse_json_object("resource", resource.as_deref())?.map(|value| {
                ResourceContext::from_json("resource", value)
            });
            let mut permissions: Vec<String> = rbac
                .get_user_permissions(&user, resource.as_ref().map(|r| r as &dyn Attributes))
                .await?
                .into_iter()
                .collect();
            permissions.sort();
            for permission in permissions {
                println!("{permission}");
            }
        }
        Commands::Check(args) => check(args, state).await?,
        Commands::Migrate | Commands::MigrateStatus => {
            anyhow::bail!("migration commands do not need the authorization state")
        }
    }
    Ok(())
}

async fn run_role(command: RoleCommand, rbac: &RbacService) -> anyhow::Result<()> {
    match command {
        RoleCommand::Create {
            name,
            description,
            level,
            organization_id,
            permissions,
        } => {
            let role = rbac
                .create_role(NewRole {
                    name,
                    description,
                    level,
                    organization_id,
                    permissions,
                })
                .await?;
            println!("Created role {} ({})", role.name, role.id);
        }
        RoleCommand::List { organization_id } => {
            println!("{:<24} {:<6} {}", "Name", "Level", "Permissions");
            for role in rbac.list_roles(organization_id.as_deref()).await? {
                println!(
                    "{:<24} {:<6} {}",
                    role.name,
                    role.level,
                    role.permission_strings().join(", ")
                );
            }
        }
        RoleCommand::Show { name } => {
            let role = find_role(rbac, &name).await?;
            println!("{}", serde_json::to_string_pretty(&role)?);
        }
        RoleCommand::Delete { name } => {
            let role = find_role(rbac, &name).await?;
            rbac.delete_role(role.id).await?;
            println!("Deleted role {}", role.name);
        }
        RoleCommand::Grant { role, permission } => {
            let role = find_role(rbac, &role).await?;
            rbac.add_permission_to_role(role.id, &permission).await?;
            println!("Granted {} to {}", permission, role.name);
        }
        RoleCommand::Revoke { role, permission } => {
            let role = find_role(rbac, &role).await?;
            rbac.remove_permission_from_role(role.id, &permission).await?;
            println!("Revoked {} from {}", permission, role.name);
        }
    }
    Ok(())
}

async fn find_role(rbac: &RbacService, name: &str) -> anyhow::Result<Role> {
    rbac.get_role_by_name(name)
        .await?
        .with_context(|| format!("role '{name}' not found"))
}

fn parse_json_object(flag: &str, raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--{flag} is not valid JSON"))?;
    if !value.is_object() {
        anyhow::bail!("--{flag} must be a JSON object");
    }
    Ok(Some(value))
}

async fn check(args: CheckArgs, state: &AuthzState) -> anyhow::Result<()> {
    let actor = Principal::new(args.user)
        .with_admin(args.admin)
        .with_permissions(args.permissions);

    let resource = parse_json_object("resource", args.resource.as_deref())?.map(|value| {
        ResourceContext {
            resource_type: args.resource_type.clone(),
            attributes: value.as_object().cloned().unwrap_or_default(),
        }
    });

    let mut ctx = EvalContext::new();
    if let Some(conditions) = parse_json_object("conditions", args.conditions.as_deref())? {
        ctx = ctx.with_conditions(conditions);
    }
    if let Some(Value::Object(values)) = parse_json_object("context", args.context.as_deref())? {
        for (key, value) in values {
            ctx = ctx.with_value(key, value);
        }
    }

    let auth = state.for_actor(Arc::new(actor));
    let decision = auth
        .authorize(
            None,
            &args.action,
            resource.as_ref().map(|r| r as &dyn Attributes),
            &ctx,
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&decision)?);

    if !decision.allowed {
        std::process::exit(1);
    }
    Ok(())
}

async fn print_status(pool: &SqlitePool) -> anyhow::Result<()> {
    let migrator = sqlx::migrate!();

    let table = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'",
    )
    .fetch_optional(pool)
    .await?;
    let applied_versions: HashSet<i64> = if table.is_some() {
        let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?;
        rows.iter()
            .filter_map(|row| row.try_get::<i64, _>("version").ok())
            .collect()
    } else {
        HashSet::new()
    };

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter() {
        let status = if applied_versions.contains(&migration.version) {
            "applied"
        } else {
            "pending"
        };
        let desc = migration.description.trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, migration.version, name);
    }

    Ok(())
}

fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    let _ = dotenvy::from_path(crate_env);
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr);

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
