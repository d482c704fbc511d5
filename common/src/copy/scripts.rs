//! Comandos de shell y ficheros que acompañan a los jobs de copia.
//!
//! El token nunca va en la línea de comandos: viaja como fichero secreto
//! `yt_token` y el script lo exporta al arrancar.

use crate::cluster::TxId;
use crate::job::JobFile;

pub const YT_TOKEN_FILE: &str = "yt_token";
pub const READ_FROM_YT_SCRIPT: &str = "read_from_yt.sh";

/// Bucle que lee pares `start end` de la entrada estándar y ejecuta
/// `read_command` para cada uno.
pub fn read_ranges_command(prepare_command: &str, read_command: &str) -> String {
    format!(
        r#"set -uxe

{prepare_command}

while true; do
    set +e
    read -r start end;
    result="$?"
    set -e
    if [ "$result" != "0" ]; then break; fi;
    {read_command}
done;"#
    )
}

/// Lectura de `[start, end)` de una tabla yt a través de su proxy.
pub fn read_from_yt_command(
    proxy: &str,
    table: &str,
    format: &str,
    transaction: Option<&TxId>,
    fastbone: bool,
) -> String {
    let hosts = if fastbone { "hosts/fb" } else { "hosts" };
    let mut command = format!(
        r#"PATH=".:$PATH" YT_RETRY_READ=1 YT_HOSTS="{hosts}" yt2 read "{table}"'[#'"${{start}}"':#'"${{end}}"']' --format '{format}' --proxy {proxy}"#
    );
    if let Some(tx) = transaction {
        command.push_str(&format!(" --tx {tx}"));
    }
    command
}

/// Ficheros del job de lectura: el token (secreto) y `read_from_yt.sh`.
pub fn read_from_yt_files(token: Option<&str>, read_command: &str) -> Vec<JobFile> {
    let mut files = Vec::new();
    let mut prepare = String::new();
    if let Some(token) = token {
        files.push(JobFile::secret(YT_TOKEN_FILE, token.to_string()));
        prepare.push_str(&format!("export YT_TOKEN=$(cat {YT_TOKEN_FILE})"));
    }
    files.push(JobFile::new(
        READ_FROM_YT_SCRIPT,
        read_ranges_command(&prepare, read_command),
    ));
    files
}

/// Lectura de un rango de filas de una tabla yamr.
pub fn read_from_yamr_command(server: &str, table: &str, range: (u64, u64), fastbone: bool) -> String {
    let mut command = format!(
        "./mapreduce -server {server} -read '{table}:[{},{}]' -lenval -subkey",
        range.0, range.1
    );
    if fastbone {
        command.push_str(" -opt net_table=fastbone");
    }
    command
}

/// Job que ejecuta el comando de cada fila `{command}`.
pub const RUN_COMMANDS_SCRIPT: &str = r#"set -ux
while true; do
    IFS=$'\t' read -r command;
    if [ "$?" != "0" ]; then
        break;
    fi
    set -e;
    bash -c "${command}";
    set +e;
done"#;

/// Escritura al final de una tabla yamr desde la entrada del job.
pub fn write_to_yamr_command(server: &str, table: &str, fastbone: bool) -> String {
    let mut command = format!("./mapreduce -server {server} -append -lenval -subkey -write {table}");
    if fastbone {
        command.push_str(" -opt net_table=fastbone");
    }
    command
}

/// Envoltorio del comando de escritura a kiwi: la salida del escritor se
/// conserva y el código de salida se propaga.
pub fn kiwi_job_command(read_command: &str, kwworm_command: &str) -> String {
    format!(
        "set -o pipefail; {read_command} | ./tm-extract-value | {kwworm_command} >output 2>&1; \
         RESULT=$?; cat output; tail -n 100 output >&2; exit $RESULT"
    )
}

/// Lectura de un fichero exportado de hive.
pub fn hive_read_command(config: &str) -> String {
    format!("./tm-hive-reader --config '{config}'")
}
