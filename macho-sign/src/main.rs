// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    log::{warn, LevelFilter},
    macho_sign::{
        sign_path, CodeSigningSlot, DigestType, MachOBinary, MachOSignError, SigningConfig,
        SigningMaterial, NO_TIMESTAMP_SERVER,
    },
    std::path::Path,
    zeroize::Zeroizing,
};

const SUPPORTED_HASHES: &[&str; 3] = &["sha1", "sha256", "sha384"];

const SIGN_ABOUT: &str = "\
Sign a Mach-O binary.

The binary is signed in place unless --output is given. Any existing
signature is replaced.

Without certificate material an ad-hoc signature is produced. Ad-hoc
signatures carry no cryptographic signature and only record the code
hashes.

Certificate material may come from PEM files (--pem-certificate and
--pem-key) or a PKCS#12 file (--p12-file). The PEM certificate file may
hold several certificates. The first is the signing certificate and the
rest are embedded as its chain.

Signatures made with a certificate can carry a time-stamp token from an
RFC 3161 server given by --timestamp-url. Time-stamp failures abort signing.
";

fn arg_path<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str, MachOSignError> {
    args.value_of(name)
        .ok_or_else(|| MachOSignError::CliBadArgument(format!("missing {}", name)))
}

fn read_password_file(path: impl AsRef<Path>) -> Result<Zeroizing<String>, MachOSignError> {
    let data = Zeroizing::new(std::fs::read_to_string(path)?);

    Ok(Zeroizing::new(
        data.lines().next().unwrap_or_default().to_string(),
    ))
}

fn material_from_args(args: &ArgMatches) -> Result<SigningMaterial, MachOSignError> {
    let material = if let Some(cert_path) = args.value_of("pem_certificate") {
        let key_path = arg_path(args, "pem_key")?;

        warn!("reading PEM certificate data from {}", cert_path);
        let cert_data = std::fs::read(cert_path)?;
        let key_data = Zeroizing::new(std::fs::read(key_path)?);
        let password = args
            .value_of("pem_key_password")
            .map(|s| Zeroizing::new(s.to_string()));

        SigningMaterial::from_pems(
            cert_data,
            key_data.as_slice(),
            password.as_ref().map(|s| s.as_str()),
        )?
    } else if let Some(p12_path) = args.value_of("p12_path") {
        let p12_data = std::fs::read(p12_path)?;

        let password = if let Some(password) = args.value_of("p12_password") {
            Zeroizing::new(password.to_string())
        } else if let Some(path) = args.value_of("p12_password_file") {
            read_password_file(path)?
        } else {
            Zeroizing::new(String::new())
        };

        SigningMaterial::from_p12(&p12_data, &password)?
    } else {
        SigningMaterial::ad_hoc()
    };

    let mut material = material;

    if let Some(identity) = args.value_of("identity") {
        material = material.with_identity(identity);
    }

    if let Some(url) = args.value_of("timestamp_url") {
        if material.is_ad_hoc() && url != NO_TIMESTAMP_SERVER {
            warn!("ignoring time-stamp server for ad-hoc signature");
        } else {
            material = material.with_timestamp_server(url)?;
        }
    }

    if let Some(path) = args.value_of("entitlements_xml_path") {
        warn!("reading entitlements from {}", path);
        material = material.with_entitlements(std::fs::read_to_string(path)?)?;
    }

    if let Some(value) = args.value_of("digest") {
        material = material.with_digest_type(DigestType::try_from(value)?)?;
    }

    Ok(material)
}

fn command_sign(args: &ArgMatches) -> Result<(), MachOSignError> {
    let path = arg_path(args, "path")?;

    let config = SigningConfig::new(path, material_from_args(args)?);
    warn!("signing {} as {}", path, config.identity());

    sign_path(&config, args.value_of("output").map(Path::new))?;

    Ok(())
}

fn command_print_signature(args: &ArgMatches) -> Result<(), MachOSignError> {
    let path = arg_path(args, "path")?;

    let binary = MachOBinary::load(path)?;

    let signature = match binary.embedded_signature()? {
        Some(signature) => signature,
        None => {
            println!("{}: no code signature", path);
            return Ok(());
        }
    };

    let (command, _) = binary.code_signature_command()?;
    println!("path: {}", path);
    println!(
        "signature data: {} bytes at offset {} ({} used)",
        command.datasize, command.dataoff, signature.length
    );
    println!("slots:");
    for blob in &signature.blobs {
        println!(
            "  {:?}: magic {:?}, {} bytes",
            blob.slot, blob.magic, blob.length
        );
    }

    if let Some(cd) = signature.code_directory()? {
        println!("code directory:");
        println!("  identifier: {}", cd.ident);
        if let Some(team_name) = &cd.team_name {
            println!("  team name: {}", team_name);
        }
        println!("  version: {:#x}", cd.version);
        println!("  flags: {:?}", cd.flags);
        println!("  hash type: {}", cd.hash_type);
        println!("  page size: {}", cd.page_size);
        println!("  code limit: {}", cd.code_limit);
        println!("  page hashes: {}", cd.code_hashes.len());

        if let Some(entry) = signature.find_slot(CodeSigningSlot::CodeDirectory) {
            println!("  cdhash: {}", hex::encode(entry.digest_with(cd.hash_type)?));
        }
    }

    match signature.signature_data()? {
        Some(data) if !data.is_empty() => {
            println!("CMS signature: present ({} bytes)", data.len());
        }
        _ => {
            println!("CMS signature: absent (ad-hoc)");
        }
    }

    Ok(())
}

fn main_impl() -> Result<(), MachOSignError> {
    let app = Command::new("Mach-O code signing in pure Rust")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Attach embedded code signatures to Mach-O binaries")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Log more. Repeat for trace output"),
        );

    let app = app.subcommand(
        Command::new("sign")
            .about("Sign a Mach-O binary")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Mach-O binary to sign"),
            )
            .arg(
                Arg::new("output")
                    .long("output")
                    .takes_value(true)
                    .help("Write the signed binary here instead of in place"),
            )
            .arg(
                Arg::new("identity")
                    .long("identity")
                    .takes_value(true)
                    .help("Code directory identifier. Defaults to the file name"),
            )
            .arg(
                Arg::new("pem_certificate")
                    .long("pem-certificate")
                    .takes_value(true)
                    .requires("pem_key")
                    .conflicts_with("p12_path")
                    .help("Path to PEM file holding the signing certificate and its chain"),
            )
            .arg(
                Arg::new("pem_key")
                    .long("pem-key")
                    .takes_value(true)
                    .requires("pem_certificate")
                    .help("Path to PEM file holding the private key"),
            )
            .arg(
                Arg::new("pem_key_password")
                    .long("pem-key-password")
                    .takes_value(true)
                    .requires("pem_key")
                    .help("Password to decrypt an ENCRYPTED PRIVATE KEY"),
            )
            .arg(
                Arg::new("p12_path")
                    .long("p12-file")
                    .alias("pfx-file")
                    .takes_value(true)
                    .help("PKCS#12 file holding the signing certificate and key"),
            )
            .arg(
                Arg::new("p12_password")
                    .long("p12-password")
                    .alias("pfx-password")
                    .takes_value(true)
                    .requires("p12_path")
                    .help("Password protecting the PKCS#12 file"),
            )
            .arg(
                Arg::new("p12_password_file")
                    .long("p12-password-file")
                    .alias("pfx-password-file")
                    .takes_value(true)
                    .requires("p12_path")
                    .conflicts_with("p12_password")
                    .help("File whose first line is the PKCS#12 password"),
            )
            .arg(
                Arg::new("timestamp_url")
                    .long("timestamp-url")
                    .takes_value(true)
                    .help(
                        "URL of time-stamp server for the CMS signature, or `none` to disable",
                    ),
            )
            .arg(
                Arg::new("entitlements_xml_path")
                    .long("entitlements-xml-path")
                    .takes_value(true)
                    .help("XML plist of entitlements to embed"),
            )
            .arg(
                Arg::new("digest")
                    .long("digest")
                    .possible_values(SUPPORTED_HASHES)
                    .takes_value(true)
                    .default_value("sha256")
                    .help("Digest algorithm to use"),
            ),
    );

    let app = app.subcommand(
        Command::new("print-signature")
            .about("Print the embedded signature of a Mach-O binary")
            .arg(
                Arg::new("path")
                    .required(true)
                    .help("Mach-O binary to inspect"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Plain messages unless debugging.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    // Quiet TLS chatter from time-stamp requests.
    if log_level == LevelFilter::Info {
        builder.filter_module("rustls", LevelFilter::Error);
    }

    builder.init();

    match matches.subcommand() {
        Some(("print-signature", args)) => command_print_signature(args),
        Some(("sign", args)) => command_sign(args),
        _ => Err(MachOSignError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
