use crate::prelude::*;

/// Per-model codes the inverter expects in setup frames, from `invcode.in`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InverterCodes {
    pub code: [u8; 4],
    pub archive_code: u8,
}

impl InverterCodes {
    pub fn load(path: &str, inverter: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read inverter code file {}", path))?;
        Self::parse(&text, inverter).with_context(|| format!("in {}", path))
    }

    /// Finds the `Inverter <name>` section for `inverter` and reads its
    /// `Code1`..`Code4` and `InvCode` hex values.
    pub fn parse(text: &str, inverter: &str) -> Result<Self> {
        let mut found = false;
        let mut code = [0u8; 4];
        let mut archive_code = 0u8;

        for line in text.lines().filter(|l| !l.starts_with('#')) {
            let mut words = line.split_whitespace();
            let (Some(variable), Some(value)) = (words.next(), words.next()) else {
                continue;
            };

            if variable == "Inverter" {
                if found {
                    break;
                }
                found = value == inverter;
                continue;
            }
            if !found {
                continue;
            }

            let slot = match variable {
                "Code1" => &mut code[0],
                "Code2" => &mut code[1],
                "Code3" => &mut code[2],
                "Code4" => &mut code[3],
                "InvCode" => &mut archive_code,
                _ => continue,
            };
            *slot = parse_hex(value).with_context(|| format!("bad {} value {:?}", variable, value))?;
        }

        if !found {
            bail!("inverter {} not found in inverter code table", inverter);
        }
        if code.contains(&0) || archive_code == 0 {
            bail!("inverter {} is missing Code1-4 or InvCode", inverter);
        }

        debug!(
            "inverter {} codes {} archive code {:02x}",
            inverter,
            Utils::hex(&code),
            archive_code
        );

        Ok(Self { code, archive_code })
    }
}

fn parse_hex(value: &str) -> Result<u8> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    Ok(u8::from_str_radix(digits, 16)?)
}
