use crate::cli::commands::*;
use crate::io::{LockBehavior, TaskFile, delta_path, read_change_table};
use crate::model::{ObjectGraph, ObjectId, Section};

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let behavior = if cli.unlocked {
        LockBehavior::Unlocked
    } else if cli.break_lock {
        LockBehavior::BreakLock
    } else {
        LockBehavior::Lock
    };

    match cli.command {
        Commands::Show(args) => cmd_show(args, behavior),
        Commands::Changes(args) => cmd_changes(args),
        Commands::Merge(args) => cmd_merge(args, behavior),
        Commands::Touch(args) => cmd_touch(args, behavior),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_show(args: ShowArgs, behavior: LockBehavior) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = TaskFile::new(&args.file, behavior);
    file.load()?;
    let graph = file.graph();

    for section in Section::ALL {
        let roots = graph.roots(section);
        if roots.is_empty() {
            continue;
        }
        println!("{section:?}:");
        for id in roots.to_vec() {
            print_tree(graph, &id, 1);
        }
    }
    file.close()?;
    Ok(())
}

fn print_tree(graph: &ObjectGraph, id: &ObjectId, depth: usize) {
    let Some(obj) = graph.get(id) else { return };
    let indent = "  ".repeat(depth);
    println!("{indent}{} [{}] ({:?})", obj.subject, obj.id, obj.kind);
    for (label, ids) in [
        ("", &obj.children),
        ("note ", &obj.notes),
        ("attachment ", &obj.attachments),
        ("effort ", &obj.efforts),
    ] {
        for child in ids {
            if !label.is_empty()
                && let Some(owned) = graph.get(child)
            {
                let inner = "  ".repeat(depth + 1);
                println!("{inner}{label}{} [{}]", owned.subject, owned.id);
                continue;
            }
            print_tree(graph, child, depth + 1);
        }
    }
}

fn cmd_changes(args: ChangesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table = read_change_table(&delta_path(&args.file))?;
    if table.is_empty() {
        println!("no pending changes");
        return Ok(());
    }
    for (device, changes) in &table {
        println!("device {device}:");
        let mut any = false;
        for (id, names) in changes.iter() {
            if names.is_empty() {
                continue;
            }
            any = true;
            let list: Vec<&str> = names.iter().map(String::as_str).collect();
            println!("  {id}: {}", list.join(", "));
        }
        if !any {
            println!("  (baseline only)");
        }
    }
    Ok(())
}

fn cmd_merge(args: MergeArgs, behavior: LockBehavior) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = TaskFile::new(&args.file, behavior);
    file.load()?;
    let conflicts = file.save()?;
    if conflicts.is_empty() {
        println!("merged, no conflicts");
    } else {
        println!("merged with conflicts (disk version kept):");
        for (id, names) in conflicts.iter() {
            let list: Vec<&str> = names.iter().map(String::as_str).collect();
            println!("  {id}: {}", list.join(", "));
        }
    }
    file.close()?;
    Ok(())
}

fn cmd_touch(args: TouchArgs, behavior: LockBehavior) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = TaskFile::new(&args.file, behavior);
    file.load()?;
    file.save()?;
    file.close()?;
    println!("wrote {}", args.file.display());
    Ok(())
}
