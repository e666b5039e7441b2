use anyhow::{bail, Context, Result};
use env_logger::Env;
use pmt::{Engine, EngineConfig, NodeKind};

// Driver program so the engine's top-level api's can be exercised without a
// separate project wired around it. A real deployment would put a query
// planner or RPC layer in front of `Engine` instead of this CLI.
fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();

    let args = std::env::args().collect::<Vec<_>>();
    match args.len() {
        0 | 1 => bail!("Missing <schema file path> and <command>"),
        2 => bail!("Missing <command>"),
        _ => {}
    }

    let config = EngineConfig::new(&args[1]);
    let engine = Engine::open(config).context("opening schema file")?;
    let root = engine.root();

    let command = &args[2];
    match command.as_str() {
        ".children" => {
            let kids = engine.children(root)?;
            let names: Vec<String> = kids.into_iter().filter_map(|id| engine.name_of(id)).collect();
            println!("{}", names.join(", "));
        }
        ".get" => {
            let name = args.get(3).context("Missing <name>")?;
            match engine.get_child(root, name)? {
                Some(id) => println!("found {name} (resident id {id:?})"),
                None => println!("{name} not found"),
            }
        }
        ".append" => {
            let name = args.get(3).context("Missing <name>")?;
            engine.append_child(root, name.clone(), NodeKind::Device, Vec::new())?;
            engine.flush()?;
            println!("appended {name}");
        }
        ".delete" => {
            let name = args.get(3).context("Missing <name>")?;
            engine.delete_child(root, name)?;
            println!("deleted {name}");
        }
        _ => bail!("Unknown command: {command}"),
    }

    engine.flush()?;
    Ok(())
}
