use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs::Dir;
use clap::{Parser, Subcommand};

use ocilayer::{
    Delta, DeltaKind, Extractor, Generator, MapOptions, OnDiskFormat, RepackOptions, UnpackOptions,
};

#[derive(Parser)]
#[command(name = "ocilayer-cli", version, about = "Apply or generate OCI layer tar streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a layer tar stream onto a root directory.
    Unpack(UnpackArgs),
    /// Generate a layer tar stream from a root directory and a delta list.
    Repack(RepackArgs),
    /// Generate a layer tar stream that inserts a directory tree under a
    /// prefix (or deletes the prefix, if no source tree is given).
    Insert(InsertArgs),
}

#[derive(Parser)]
struct InsertArgs {
    /// Directory tree to insert; omit to emit a single whiteout instead
    #[arg(long)]
    source: Option<Utf8PathBuf>,

    /// Path the source tree (or the whiteout) is placed at in the archive
    #[arg(long)]
    target: Utf8PathBuf,

    /// Precede the inserted tree with an opaque-whiteout marker, so it
    /// replaces rather than merges with the corresponding lower-layer path
    #[arg(long)]
    opaque: bool,

    /// Output file path (defaults to stdout)
    #[arg(short, long, value_name = "PATH")]
    output: Option<Utf8PathBuf>,

    /// Unix timestamp; no emitted mtime will exceed this value
    #[arg(long, value_name = "EPOCH", env = "SOURCE_DATE_EPOCH", hide_env_values = true)]
    source_date_epoch: Option<i64>,
}

#[derive(Parser)]
struct UnpackArgs {
    /// Root directory to extract into
    #[arg(long, env = "OCILAYER_ROOT", hide_env_values = true)]
    root: Utf8PathBuf,

    /// Layer tar stream (defaults to stdin)
    #[arg(long, value_name = "PATH")]
    layer: Option<Utf8PathBuf>,

    /// Treat the root as a live overlayfs upperdir rather than a plain
    /// extracted directory tree
    #[arg(long)]
    overlayfs: bool,

    /// Overlayfs xattr namespace to use when `--overlayfs` is set
    #[arg(long, value_enum, default_value = "trusted")]
    namespace: NamespaceArg,

    /// Emulate rootless extraction via the `user.rootlesscontainers` xattr
    #[arg(long)]
    rootless: bool,

    /// Preserve an existing directory symlink instead of clobbering it with
    /// a real directory
    #[arg(long)]
    keep_dirlinks: bool,
}

#[derive(Parser)]
struct RepackArgs {
    /// Root directory to read from
    #[arg(long, env = "OCILAYER_ROOT", hide_env_values = true)]
    root: Utf8PathBuf,

    /// Output file path (defaults to stdout)
    #[arg(short, long, value_name = "PATH")]
    output: Option<Utf8PathBuf>,

    /// Paths added or modified since the parent layer
    #[arg(long = "added", value_name = "PATH")]
    added: Vec<Utf8PathBuf>,

    /// Paths removed since the parent layer
    #[arg(long = "removed", value_name = "PATH")]
    removed: Vec<Utf8PathBuf>,

    /// Treat the root as a live overlayfs upperdir rather than a plain
    /// extracted directory tree
    #[arg(long)]
    overlayfs: bool,

    /// Overlayfs xattr namespace to use when `--overlayfs` is set
    #[arg(long, value_enum, default_value = "trusted")]
    namespace: NamespaceArg,

    /// Emulate rootless extraction via the `user.rootlesscontainers` xattr
    #[arg(long)]
    rootless: bool,

    /// Unix timestamp; no emitted mtime will exceed this value
    #[arg(long, value_name = "EPOCH", env = "SOURCE_DATE_EPOCH", hide_env_values = true)]
    source_date_epoch: Option<i64>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum NamespaceArg {
    Trusted,
    User,
}

fn on_disk_format(overlayfs: bool, namespace: NamespaceArg, rootless: bool) -> OnDiskFormat {
    let map = MapOptions {
        rootless,
        ..Default::default()
    };
    if overlayfs {
        OnDiskFormat::OverlayfsRootfs {
            map,
            user_xattr: matches!(namespace, NamespaceArg::User),
        }
    } else {
        OnDiskFormat::DirRootfs { map }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Unpack(args) => run_unpack(args),
        Command::Repack(args) => run_repack(args),
        Command::Insert(args) => run_insert(args),
    }
}

fn run_unpack(args: UnpackArgs) -> Result<()> {
    let root = Dir::open_ambient_dir(args.root.as_std_path(), ambient_authority())
        .with_context(|| format!("opening root {}", args.root))?;

    let options = UnpackOptions {
        on_disk_format: on_disk_format(args.overlayfs, args.namespace, args.rootless),
        keep_dirlinks: args.keep_dirlinks,
    };
    let mut extractor = Extractor::new(root, options);

    if let Some(layer_path) = &args.layer {
        let file = std::fs::File::open(layer_path)
            .with_context(|| format!("opening layer {}", layer_path))?;
        let mut archive = tar::Archive::new(file);
        extractor
            .unpack_layer(&mut archive)
            .with_context(|| format!("unpacking {}", layer_path))?;
    } else {
        let mut archive = tar::Archive::new(std::io::stdin().lock());
        extractor
            .unpack_layer(&mut archive)
            .context("unpacking layer from stdin")?;
    }

    Ok(())
}

fn run_insert(args: InsertArgs) -> Result<()> {
    // `Generator`'s own root directory is never consulted by
    // `generate_insert_layer` (it reads from the explicit `source` handle
    // instead), so any open directory handle will do here.
    let placeholder_root = Dir::open_ambient_dir(".", ambient_authority())
        .context("opening current directory as a placeholder engine root")?;

    let source = args
        .source
        .as_ref()
        .map(|p| {
            Dir::open_ambient_dir(p.as_std_path(), ambient_authority())
                .with_context(|| format!("opening insert source {p}"))
        })
        .transpose()?;

    let options = RepackOptions {
        on_disk_format: OnDiskFormat::DirRootfs {
            map: MapOptions::default(),
        },
        source_date_epoch: args.source_date_epoch,
    };

    if let Some(output_path) = &args.output {
        let file = std::fs::File::create(output_path)
            .with_context(|| format!("creating output file {}", output_path))?;
        let mut generator = Generator::new(placeholder_root, options, file);
        generator
            .generate_insert_layer(source.as_ref(), &args.target, args.opaque)
            .context("generating insert layer")?;
        generator.finish().context("finishing layer")?;
    } else {
        let mut generator = Generator::new(placeholder_root, options, std::io::stdout().lock());
        generator
            .generate_insert_layer(source.as_ref(), &args.target, args.opaque)
            .context("generating insert layer")?;
        generator.finish().context("finishing layer")?;
    }

    Ok(())
}

fn run_repack(args: RepackArgs) -> Result<()> {
    let root = Dir::open_ambient_dir(args.root.as_std_path(), ambient_authority())
        .with_context(|| format!("opening root {}", args.root))?;

    let deltas: Vec<Delta> = args
        .added
        .iter()
        .cloned()
        .map(|path| Delta {
            path,
            kind: DeltaKind::Added,
        })
        .chain(args.removed.iter().cloned().map(|path| Delta {
            path,
            kind: DeltaKind::Missing,
        }))
        .collect();

    let options = RepackOptions {
        on_disk_format: on_disk_format(args.overlayfs, args.namespace, args.rootless),
        source_date_epoch: args.source_date_epoch,
    };

    if let Some(output_path) = &args.output {
        let file = std::fs::File::create(output_path)
            .with_context(|| format!("creating output file {}", output_path))?;
        let mut generator = Generator::new(root, options, file);
        generator.generate_layer(&deltas).context("generating layer")?;
        generator.finish().context("finishing layer")?;
    } else {
        let mut generator = Generator::new(root, options, std::io::stdout().lock());
        generator.generate_layer(&deltas).context("generating layer")?;
        generator.finish().context("finishing layer")?;
    }

    Ok(())
}
